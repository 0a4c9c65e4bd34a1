use clap::{App, Arg};
use comaster::config::{DeviceConfig, MasterConfig};
use comaster::master::MasterNode;
use comaster::service;
use comaster::sim::{SimulatedBus, SimulatedNode};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "master.json";
const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("comaster")
        .version(env!("CARGO_PKG_VERSION"))
        .about("CANopen master daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Master configuration (JSON)")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Address the service listens on")
                .takes_value(true)
                .default_value(DEFAULT_BIND),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Service port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Serve the configured nodes from an in-process simulated bus"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let bind = matches.value_of("bind").unwrap_or(DEFAULT_BIND).to_string();
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;

    let config = MasterConfig::load(Path::new(config_path))?;
    let device = DeviceConfig::load(&config.dcf_txt, config.dcf_bin.as_deref())?;

    if !matches.is_present("simulate") {
        error!("No CAN driver for '{}' is built in", config.can_interface);
        return Err("physical CAN interfaces are not supported, run with --simulate".into());
    }

    let bus = SimulatedBus::new(&config.can_interface)?;
    for &node in device.assigned_nodes() {
        if node != config.node_id {
            bus.attach(SimulatedNode::standard(node));
        }
    }
    info!("Simulating {} node(s) on {}", device.assigned_nodes().len(), bus.interface());

    let master = Arc::new(MasterNode::with_device(&config, &device, &bus)?);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let listener = TcpListener::bind((bind.as_str(), port)).await?;
        let server = tokio::spawn(service::serve(listener, Arc::clone(&master)));

        // returns once a termination signal has run the master down
        let waiter = Arc::clone(&master);
        tokio::task::spawn_blocking(move || waiter.wait()).await?;

        server.abort();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    info!("Master '{}' stopped", master.name());
    Ok(())
}
