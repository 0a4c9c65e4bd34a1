//! JSON-lines TCP service exposing a master's read/write handlers.
//!
//! Each request line names a service (`<node_name>/sdo_read`,
//! `<node_name>/sdo_write` or `ping`) and carries its request object; each
//! response line echoes the request id.

use crate::handlers::{on_sdo_read, on_sdo_write, ReadRequest, WriteRequest};
use crate::master::{MasterInterface, MasterNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT: u16 = 8080;

pub const SDO_READ: &str = "sdo_read";
pub const SDO_WRITE: &str = "sdo_write";
pub const PING: &str = "ping";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(default)]
    pub id: u32,
    pub service: String,
    #[serde(default)]
    pub request: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Success,
    UnknownService,
    InvalidRequest,
    ParseError,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: u32,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceResponse {
    fn success(id: u32, response: Value) -> Self {
        Self { id, status: ServiceStatus::Success, response: Some(response), message: None }
    }

    fn failure(id: u32, status: ServiceStatus, message: String) -> Self {
        Self { id, status, response: None, message: Some(message) }
    }
}

#[derive(Deserialize)]
struct RequestId {
    #[serde(default)]
    id: u32,
}

/// Request id of a line, or 0 when the line carries none. Lets replies that
/// never reach the router still echo the caller's id.
pub fn request_id(line: &str) -> u32 {
    serde_json::from_str::<RequestId>(line).map_or(0, |r| r.id)
}

/// Maps service names of one master to its handlers.
#[derive(Debug, Clone)]
pub struct ServiceRouter {
    node_name: String,
    read_service: String,
    write_service: String,
}

impl ServiceRouter {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            read_service: format!("{}/{}", node_name, SDO_READ),
            write_service: format!("{}/{}", node_name, SDO_WRITE),
        }
    }

    pub fn for_master(master: &MasterNode) -> Self {
        Self::new(master.name())
    }

    pub fn services(&self) -> [&str; 3] {
        [self.read_service.as_str(), self.write_service.as_str(), PING]
    }

    /// Handles one request line. Blocks until the master has answered.
    pub fn dispatch<M: MasterInterface + ?Sized>(&self, master: &M, line: &str) -> ServiceResponse {
        let request: ServiceRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unparseable service request: {}", e);
                return ServiceResponse::failure(
                    request_id(line),
                    ServiceStatus::ParseError,
                    format!("Invalid request format: {}", e),
                );
            }
        };
        let id = request.id;

        let outcome = if request.service == self.read_service {
            serde_json::from_value::<ReadRequest>(request.request)
                .map(|r| serde_json::to_value(on_sdo_read(master, &r)))
        } else if request.service == self.write_service {
            serde_json::from_value::<WriteRequest>(request.request)
                .map(|r| serde_json::to_value(on_sdo_write(master, &r)))
        } else if request.service == PING {
            Ok(Ok(serde_json::json!({ "node_name": self.node_name })))
        } else {
            return ServiceResponse::failure(
                id,
                ServiceStatus::UnknownService,
                format!("No service named '{}'", request.service),
            );
        };

        match outcome {
            Ok(Ok(response)) => ServiceResponse::success(id, response),
            Ok(Err(e)) => ServiceResponse::failure(id, ServiceStatus::InvalidRequest, e.to_string()),
            Err(e) => ServiceResponse::failure(id, ServiceStatus::InvalidRequest, format!("Invalid {} request: {}", request.service, e)),
        }
    }
}

/// Accepts clients until the listener fails. Every request is carried out
/// on the blocking pool, so client tasks never block the reactor.
pub async fn serve(listener: TcpListener, master: Arc<MasterNode>) -> std::io::Result<()> {
    let router = Arc::new(ServiceRouter::for_master(&master));
    info!("Serving {:?} on {}", router.services(), listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Client connected: {}", addr);
                let master = Arc::clone(&master);
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, master, router).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: TcpStream, master: Arc<MasterNode>, router: Arc<ServiceRouter>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("Request: {}", line);

        let id = request_id(&line);
        let response = if master.shutdown_controller().is_armed() {
            let master = Arc::clone(&master);
            let router = Arc::clone(&router);
            tokio::task::spawn_blocking(move || router.dispatch(master.as_ref(), &line))
                .await
                .unwrap_or_else(|e| ServiceResponse::failure(id, ServiceStatus::Unavailable, e.to_string()))
        } else {
            ServiceResponse::failure(id, ServiceStatus::Unavailable, "Master is shutting down".to_string())
        };

        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
    }
    Ok(())
}
