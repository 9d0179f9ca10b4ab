use crate::error::DevdError;
use crate::gateway::NodeMapping;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ADS_HOST: &str = "ads-dev.aylanetworks.com";
pub const DEFAULT_POLL_INTERVAL: u32 = 300;
pub const DEFAULT_LAN_KEEP_ALIVE: u32 = 30;
pub const DEFAULT_MSG_SOCKET: &str = "/tmp/devd/msg_sock";
pub const DEFAULT_LAN_LISTEN: &str = "0.0.0.0:10275";

/// Daemon configuration. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DevdConfig {
    pub device: DeviceConfig,
    pub client: ClientConfig,
    pub lan: LanConfig,
    pub notify: NotifyConfig,
    pub msg: MsgConfig,
    pub lan_server: LanServerConfig,
    pub ota: OtaConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub dsn: String,
    pub ads_host: String,
    pub model: String,
    pub sw_version: String,
    pub oem_id: String,
    pub oem_model: String,
    pub oem_key: String,
    pub template_version: String,
    /// Pre-provisioned cloud credential, sent as `Ayla1.0 <token>`.
    pub auth_token: Option<String>,
    pub setup_token: String,
    pub location: String,
    pub ssid: String,
    pub mac: String,
    pub hwsig: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            ads_host: DEFAULT_ADS_HOST.to_string(),
            model: "AY001MUX1".to_string(),
            sw_version: concat!("devd-rs ", env!("CARGO_PKG_VERSION")).to_string(),
            oem_id: String::new(),
            oem_model: String::new(),
            oem_key: String::new(),
            template_version: String::new(),
            auth_token: None,
            setup_token: String::new(),
            location: String::new(),
            ssid: String::new(),
            mac: String::new(),
            hwsig: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds between command polls while notify is not up. Zero disables polling.
    pub poll_interval: u32,
    /// Default cloud request timeout, seconds.
    pub request_timeout: u64,
    pub ping_timeout: u64,
    /// Use plain HTTP for cloud requests (test servers).
    pub insecure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, request_timeout: 60, ping_timeout: 5, insecure: false }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LanConfig {
    pub enable: bool,
    pub auto_sync: bool,
    pub keep_alive: u32,
    pub key_id: u32,
    pub key: String,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            enable: false,
            auto_sync: true,
            keep_alive: DEFAULT_LAN_KEEP_ALIVE,
            key_id: 0,
            key: String::new(),
        }
    }
}

impl LanConfig {
    /// Reads the `lanip` object the cloud pushes. Key and key id are only
    /// required when LAN mode is enabled.
    pub fn from_lanip(lanip: &Value) -> Result<Self, DevdError> {
        let status = lanip
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| DevdError::config("lanip status not set"))?;
        let enable = status == "enable";
        let key = lanip.get("lanip_key").and_then(Value::as_str);
        if key.is_none() && enable {
            return Err(DevdError::config("lanip key not set"));
        }
        let key_id = match lanip.get("lanip_key_id").and_then(Value::as_u64) {
            Some(id) => u32::try_from(id).map_err(|_| DevdError::config("lanip key_id out of range"))?,
            None if enable => return Err(DevdError::config("lanip key_id not set")),
            None => 0,
        };
        Ok(Self {
            enable,
            auto_sync: lanip.get("auto_sync").and_then(Value::as_bool).unwrap_or(true),
            keep_alive: lanip
                .get("keep_alive")
                .and_then(Value::as_u64)
                .and_then(|secs| u32::try_from(secs).ok())
                .unwrap_or(DEFAULT_LAN_KEEP_ALIVE),
            key_id,
            key: key.unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub poll_interval: u32,
    /// Overrides the server name handed out by the cloud.
    pub server: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, server: None }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MsgConfig {
    pub socket_path: PathBuf,
    /// Zero means unlimited.
    pub max_sessions: usize,
}

impl Default for MsgConfig {
    fn default() -> Self {
        Self { socket_path: PathBuf::from(DEFAULT_MSG_SOCKET), max_sessions: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LanServerConfig {
    pub listen: String,
}

impl Default for LanServerConfig {
    fn default() -> Self {
        Self { listen: DEFAULT_LAN_LISTEN.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Program run with the image URL and metadata once an OTA is ready.
    pub command: Option<PathBuf>,
}

/// Nodes the cloud has registered behind this gateway. Rewritten whenever a
/// node is added or removed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub node_mappings: Vec<NodeMapping>,
}

impl DevdConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Writes the configuration to `path` through a temporary file in the
    /// same directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let path = path.as_ref();
        let contents =
            self.to_toml().map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)
    }

    pub fn lan_keep_alive_secs(&self) -> u32 {
        match self.lan.keep_alive {
            0 => DEFAULT_LAN_KEEP_ALIVE,
            secs => secs,
        }
    }

    pub fn cloud_scheme(&self) -> &'static str {
        if self.client.insecure {
            "http"
        } else {
            "https"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let config = DevdConfig::from_toml(
            r#"
            [device]
            dsn = "AC000W000000001"

            [lan]
            enable = true
            key = "0123456789abcdef"
            "#,
        )
        .expect("parse");
        assert_eq!(config.device.dsn, "AC000W000000001");
        assert_eq!(config.device.ads_host, DEFAULT_ADS_HOST);
        assert_eq!(config.client.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(config.lan.enable);
        assert!(config.lan.auto_sync);
        assert_eq!(config.msg.socket_path, PathBuf::from(DEFAULT_MSG_SOCKET));
    }

    #[test]
    fn lanip_object_requires_key_only_when_enabled() {
        let lan = LanConfig::from_lanip(&serde_json::json!({
            "status": "enable",
            "lanip_key": "k3y",
            "lanip_key_id": 1234,
            "keep_alive": 45,
        }))
        .expect("enabled lanip");
        assert!(lan.enable);
        assert!(lan.auto_sync);
        assert_eq!((lan.key_id, lan.keep_alive), (1234, 45));

        let disabled = LanConfig::from_lanip(&serde_json::json!({"status": "disable"})).expect("disabled");
        assert!(!disabled.enable);
        assert!(LanConfig::from_lanip(&serde_json::json!({"status": "enable"})).is_err());
        assert!(LanConfig::from_lanip(&serde_json::json!({})).is_err());
    }

    #[test]
    fn zero_keep_alive_falls_back_to_default() {
        let mut config = DevdConfig::default();
        config.lan.keep_alive = 0;
        assert_eq!(config.lan_keep_alive_secs(), DEFAULT_LAN_KEEP_ALIVE);
    }

    #[test]
    fn node_mappings_survive_save_and_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("devd.toml");
        let mut config = DevdConfig::default();
        config.device.dsn = "AC000W000000001".to_string();
        config.gateway.node_mappings =
            vec![NodeMapping { dsn: "VR00ZN001".to_string(), address: "00:11:22".to_string() }];
        config.save(&path).expect("save");
        assert!(!path.with_extension("toml.tmp").exists());
        assert_eq!(DevdConfig::from_path(&path).expect("load"), config);
    }

    #[test]
    fn from_path_reports_invalid_data() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("devd.toml");
        fs::write(&path, "[client]\npoll_interval = \"soon\"\n").expect("write");
        let err = DevdConfig::from_path(&path).expect_err("bad type");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
