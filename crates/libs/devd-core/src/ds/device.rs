use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

/// API version advertised to the cloud.
pub const API_MAJOR: i64 = 1;
pub const API_MINOR: i64 = 0;
/// Notify cipher key length.
pub const NOTIFY_KEY_LEN: usize = 16;

/// Device attributes the daemon owns and keeps in sync with the cloud record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAttributes {
    pub sw_version: String,
    pub model: String,
    pub lan_ip: String,
    pub oem: String,
    pub oem_model: String,
    pub oem_key: String,
    pub mac: Option<String>,
    pub hwsig: Option<String>,
    pub setup_token: String,
    pub location: String,
    pub ssid: String,
}

/// Fields of interest in the `device` object of the cloud record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub key: String,
    pub cipher_key: Vec<u8>,
    /// Notify server name. `None` when notify is disabled for this device.
    pub notify_server: Option<String>,
    pub template_version: Option<String>,
    pub regtoken: Option<String>,
    pub product_name: Option<String>,
    pub registration_type: Option<String>,
    pub registered: bool,
    pub unix_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InfoError {
    #[error("no device object")]
    NoDevice,
    #[error("missing or invalid {0}")]
    Field(&'static str),
    #[error("cipher key is {0} bytes")]
    ShortKey(usize),
}

fn string_field(device: &Value, name: &str) -> Option<String> {
    device.get(name).and_then(Value::as_str).map(str::to_string)
}

impl DeviceInfo {
    /// Parses the body of the device record GET.
    pub fn parse(body: &Value) -> Result<Self, InfoError> {
        let device = body.get("device").filter(|d| d.is_object()).ok_or(InfoError::NoDevice)?;
        let key = device
            .get("key")
            .and_then(Value::as_u64)
            .ok_or(InfoError::Field("key"))?
            .to_string();

        let encoded = device
            .get("ans_cipher_key")
            .and_then(Value::as_str)
            .ok_or(InfoError::Field("ans_cipher_key"))?;
        let mut cipher_key = BASE64
            .decode(encoded)
            .map_err(|_| InfoError::Field("ans_cipher_key"))?;
        if cipher_key.len() < NOTIFY_KEY_LEN {
            return Err(InfoError::ShortKey(cipher_key.len()));
        }
        cipher_key.truncate(NOTIFY_KEY_LEN);

        let server = device
            .get("ans_server")
            .and_then(Value::as_str)
            .ok_or(InfoError::Field("ans_server"))?;

        Ok(Self {
            key,
            cipher_key,
            notify_server: (!server.is_empty()).then(|| server.to_string()),
            template_version: string_field(device, "template_version"),
            regtoken: string_field(device, "regtoken"),
            product_name: string_field(device, "product_name"),
            registration_type: string_field(device, "registration_type"),
            registered: device.get("registered").and_then(Value::as_bool).unwrap_or(false),
            unix_time: device.get("unix_time").and_then(Value::as_i64),
        })
    }
}

fn differs(record: &Value, name: &str, local: &str) -> bool {
    record.get(name).and_then(Value::as_str) != Some(local)
}

impl LocalAttributes {
    /// Builds the attribute PUT body for every value the cloud record has
    /// wrong. Returns `None` when the record is current.
    pub fn diff(&self, body: &Value) -> Option<Value> {
        let record = body.get("device").unwrap_or(&Value::Null);
        let mut update = Map::new();

        for (name, local) in [("api_major", API_MAJOR), ("api_minor", API_MINOR)] {
            if record.get(name).and_then(Value::as_i64) != Some(local) {
                update.insert(name.to_string(), json!(local));
            }
        }
        let mut put = |name: &str, local: &str| {
            if differs(record, name, local) {
                update.insert(name.to_string(), json!(local));
            }
        };
        put("sw_version", &self.sw_version);
        put("model", &self.model);
        put("lan_ip", &self.lan_ip);
        if let Some(mac) = &self.mac {
            put("mac", mac);
        }
        if let Some(hwsig) = &self.hwsig {
            put("hwsig", hwsig);
        }
        put("setup_token", &self.setup_token);
        put("setup_location", &self.location);
        put("ssid", &self.ssid);

        // The OEM triple goes out together.
        if differs(record, "oem", &self.oem) || differs(record, "oem_model", &self.oem_model) {
            update.insert("oem".to_string(), json!(self.oem));
            update.insert("oem_model".to_string(), json!(self.oem_model));
            update.insert("oem_key".to_string(), json!(self.oem_key));
        }

        if update.is_empty() {
            return None;
        }
        Some(json!({ "device": update }))
    }

    pub fn oem_info(&self, template_version: &str) -> Value {
        json!({
            "oem": self.oem,
            "oem_model": self.oem_model,
            "oem_key": self.oem_key,
            "template_version": template_version,
        })
    }
}
