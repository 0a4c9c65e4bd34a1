use crate::channel::{parse_interface_name, InterfaceName};
use crate::error::ConfigError;
use crate::frame::{is_valid_node_id, NodeId, MAX_NODE_ID};
use crate::shutdown::ForcePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SDO_TIMEOUT_MS: u64 = 1000;

/// NMT slave assignment object; sub-index N describes node N.
const SLAVE_ASSIGNMENT_INDEX: &str = "1F81";

fn default_sdo_timeout_ms() -> u64 {
    DEFAULT_SDO_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub node_name: String,
    pub can_interface: String,
    pub node_id: NodeId,
    pub dcf_txt: PathBuf,
    #[serde(default)]
    pub dcf_bin: Option<PathBuf>,
    #[serde(default = "default_sdo_timeout_ms")]
    pub sdo_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub watch_signals: bool,
    #[serde(default)]
    pub force_policy: ForcePolicy,
}

impl MasterConfig {
    pub fn new(node_name: &str, can_interface: &str, node_id: NodeId) -> Self {
        Self {
            node_name: node_name.to_string(),
            can_interface: can_interface.to_string(),
            node_id,
            dcf_txt: PathBuf::from("master.dcf"),
            dcf_bin: None,
            sdo_timeout_ms: DEFAULT_SDO_TIMEOUT_MS,
            watch_signals: true,
            force_policy: ForcePolicy::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_text(path)?;
        let mut config: MasterConfig = serde_json::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Makes relative DCF paths relative to `base` (the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.dcf_txt.is_relative() {
            self.dcf_txt = base.join(&self.dcf_txt);
        }
        if let Some(bin) = self.dcf_bin.as_mut().filter(|p| p.is_relative()) {
            *bin = base.join(&*bin);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() || self.node_name.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "node_name",
                reason: format!("'{}' is not a usable service prefix", self.node_name),
            });
        }
        if !is_valid_node_id(self.node_id) {
            return Err(ConfigError::InvalidValue {
                field: "node_id",
                reason: format!("{} is outside 1..={}", self.node_id, MAX_NODE_ID),
            });
        }
        if self.sdo_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sdo_timeout_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        self.interface_name()?;
        Ok(())
    }

    pub fn interface_name(&self) -> Result<InterfaceName, ConfigError> {
        parse_interface_name(&self.can_interface).map_err(|e| ConfigError::InvalidValue {
            field: "can_interface",
            reason: e.to_string(),
        })
    }

    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }
}

/// One entry of a concise DCF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConciseEntry {
    pub index: u16,
    pub subindex: u8,
    pub data: Vec<u8>,
}

/// Master device configuration: the text DCF and its compiled concise form.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    assigned_nodes: Vec<NodeId>,
    concise: Vec<ConciseEntry>,
}

impl DeviceConfig {
    pub fn load(dcf_txt: &Path, dcf_bin: Option<&Path>) -> Result<Self, ConfigError> {
        let text = read_text(dcf_txt)?;
        let binary = match dcf_bin {
            Some(path) => Some(std::fs::read(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?),
            None => None,
        };
        Self::parse(&text, binary.as_deref())
    }

    pub fn parse(text: &str, binary: Option<&[u8]>) -> Result<Self, ConfigError> {
        let mut assigned_nodes = parse_slave_assignment(text)?;
        assigned_nodes.sort_unstable();
        assigned_nodes.dedup();

        let concise = match binary {
            Some(bytes) => parse_concise(bytes)?,
            None => Vec::new(),
        };

        Ok(Self { assigned_nodes, concise })
    }

    /// Nodes the master is configured to manage.
    pub fn assigned_nodes(&self) -> &[NodeId] {
        &self.assigned_nodes
    }

    pub fn concise_entries(&self) -> &[ConciseEntry] {
        &self.concise
    }
}

fn read_text(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Parses a decimal or `0x`-prefixed hexadecimal number, ignoring
/// surrounding whitespace.
pub fn parse_number(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

/// Collects nodes flagged as slaves in `[1F81subN]` sections.
fn parse_slave_assignment(text: &str) -> Result<Vec<NodeId>, ConfigError> {
    let mut nodes = Vec::new();
    let mut current: Option<NodeId> = None;

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[') {
            let section = section.strip_suffix(']').ok_or_else(|| ConfigError::Dcf {
                line: number + 1,
                reason: "unterminated section header".to_string(),
            })?;
            current = section
                .to_ascii_uppercase()
                .strip_prefix(SLAVE_ASSIGNMENT_INDEX)
                .and_then(|rest| rest.strip_prefix("SUB"))
                .and_then(|sub| u8::from_str_radix(sub, 16).ok())
                .filter(|sub| is_valid_node_id(*sub));
            continue;
        }

        let Some(node) = current else { continue };
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Dcf {
                line: number + 1,
                reason: format!("expected key=value, got '{}'", line),
            });
        };
        if key.trim().eq_ignore_ascii_case("DefaultValue") {
            let value = parse_number(value).ok_or_else(|| ConfigError::Dcf {
                line: number + 1,
                reason: format!("invalid DefaultValue '{}'", value.trim()),
            })?;
            // bit 0: node is a slave
            if value & 0x01 != 0 {
                nodes.push(node);
            }
        }
    }

    Ok(nodes)
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], ConfigError> {
    let end = offset.checked_add(len).filter(|end| *end <= bytes.len());
    let Some(end) = end else {
        return Err(ConfigError::ConciseTruncated(*offset));
    };
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

/// Concise DCF: u32 entry count, then per entry u16 index, u8 sub-index,
/// u32 size and the data bytes, all little endian.
fn parse_concise(bytes: &[u8]) -> Result<Vec<ConciseEntry>, ConfigError> {
    let mut offset = 0;
    let count = take(bytes, &mut offset, 4)?;
    let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]);

    let mut entries = Vec::new();
    for _ in 0..count {
        let head = take(bytes, &mut offset, 7)?;
        let index = u16::from_le_bytes([head[0], head[1]]);
        let subindex = head[2];
        let size = u32::from_le_bytes([head[3], head[4], head[5], head[6]]) as usize;
        let data = take(bytes, &mut offset, size)?.to_vec();
        entries.push(ConciseEntry { index, subindex, data });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DCF: &str = "\
[DeviceComissioning]
NodeID=1

[1F81]
SubNumber=128

[1F81sub5]
ParameterName=NMT slave assignment 5
DataType=0x0007
DefaultValue=0x00000005

[1F81sub6]
DefaultValue=0

[1F81sub1A]
DefaultValue=1
";

    #[test]
    fn test_slave_assignment_parsing() {
        let device = DeviceConfig::parse(DCF, None).unwrap();
        assert_eq!(device.assigned_nodes(), &[5, 0x1A]);
    }

    #[test]
    fn test_dcf_rejects_bad_default_value() {
        let err = DeviceConfig::parse("[1F81sub5]\nDefaultValue=banana\n", None).unwrap_err();
        assert!(matches!(err, ConfigError::Dcf { line: 2, .. }));
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number(" 0x2000 "), Some(0x2000));
        assert_eq!(parse_number("0XFF"), Some(0xFF));
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_number("-1"), None);
    }

    #[test]
    fn test_concise_dcf_parsing() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0x1017u16.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&1000u16.to_le_bytes());

        let device = DeviceConfig::parse("", Some(&bytes)).unwrap();
        assert_eq!(
            device.concise_entries(),
            &[ConciseEntry { index: 0x1017, subindex: 0, data: vec![0xE8, 0x03] }]
        );
    }

    #[test]
    fn test_concise_dcf_truncated() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0x17, 0x10, 0x00]);
        assert!(matches!(
            DeviceConfig::parse("", Some(&bytes)),
            Err(ConfigError::ConciseTruncated(4))
        ));
    }

    #[test]
    fn test_master_config_defaults_from_json() {
        let json = r#"{
            "node_name": "master",
            "can_interface": "vcan0",
            "node_id": 1,
            "dcf_txt": "master.dcf"
        }"#;
        let config: MasterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sdo_timeout_ms, DEFAULT_SDO_TIMEOUT_MS);
        assert!(config.watch_signals);
        assert_eq!(config.force_policy, ForcePolicy::Exit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_master_config_validation() {
        let mut config = MasterConfig::new("master", "vcan0", 0);
        assert!(config.validate().is_err());

        config.node_id = 128;
        assert!(config.validate().is_err());

        config.node_id = 1;
        config.can_interface = String::new();
        assert!(config.validate().is_err());

        config.can_interface = "vcan0".to_string();
        config.node_name = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_dcf_paths_follow_config_file() {
        let mut config = MasterConfig::new("master", "vcan0", 1);
        config.dcf_bin = Some(PathBuf::from("/abs/master.bin"));
        config.resolve_paths(Path::new("/etc/comaster"));
        assert_eq!(config.dcf_txt, PathBuf::from("/etc/comaster/master.dcf"));
        assert_eq!(config.dcf_bin, Some(PathBuf::from("/abs/master.bin")));
    }

    #[test]
    fn test_missing_dcf_file_is_io_error() {
        let err = DeviceConfig::load(Path::new("/nonexistent/master.dcf"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
