//! Encrypted command channel to LAN clients.
//!
//! A client registers through the local HTTP endpoint, the daemon runs a key
//! exchange against the client's own server, then fetches commands and
//! posts property updates as signed and encrypted envelopes.

pub mod crypto;
mod seal;
mod table;

pub use seal::RsaSealer;
pub use table::{LanCommands, LanSession, LanStep, LanStepKind, LanTable};

use crate::http::STATUS_BAD_REQUEST;
use serde_json::Value;
use std::net::Ipv4Addr;

pub const EXCHANGE_VERSION: u32 = 1;
pub const PROTO: u32 = 1;
/// Refreshes without a notify before the daemon fetches commands anyway.
pub const REFRESH_LIMIT: u32 = 10;
/// Raw nonce bytes; the exchanged nonce is their base64 form.
pub const RANDOM_LEN: usize = 12;
/// Size of the per-session secret sealed for clients that sent a public key.
pub const SEALED_SECRET_LEN: usize = 32;

const PEM_BEGIN: &str = "-----BEGIN RSA PUBLIC KEY-----";
const PEM_END: &str = "-----END RSA PUBLIC KEY-----";
const PEM_LINE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LanError {
    /// Session keys do not match the client's; the session must be re-established.
    #[error("lan key mismatch")]
    KeyMismatch,
    /// Packet signature did not verify; the packet is dropped.
    #[error("lan signature mismatch")]
    SignatureMismatch,
    #[error("lan decode error in {0}")]
    Decode(&'static str),
    #[error("no lan session {0}")]
    NoSession(u8),
    #[error("lan key seal failed: {0}")]
    Seal(String),
}

impl LanError {
    /// Errors after which the session cannot continue.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::KeyMismatch | Self::NoSession(_) | Self::Seal(_))
    }
}

/// Encrypts the session secret for a client that supplied its public key.
pub trait KeySealer {
    fn seal(&self, public_key_pem: &str, secret: &[u8]) -> Result<Vec<u8>, LanError>;
}

/// Wraps a bare base64 public key in PEM armor, 64 characters per line.
pub fn convert_pubkey_pem(key: &str) -> String {
    let mut pem = String::with_capacity(key.len() + key.len() / PEM_LINE + PEM_BEGIN.len() + PEM_END.len() + 4);
    pem.push_str(PEM_BEGIN);
    pem.push('\n');
    for line in key.as_bytes().chunks(PEM_LINE) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_END);
    pem.push('\n');
    pem
}

/// Body of a `local_reg.json` POST or PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanRegistration {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub uri: String,
    pub notify: bool,
    pub public_key: Option<String>,
}

impl LanRegistration {
    /// Parses `{"local_reg": {...}}`. Errors carry the HTTP status to return.
    pub fn parse(body: &Value) -> Result<Self, u16> {
        let Some(reg) = body.get("local_reg").filter(|reg| reg.is_object()) else {
            log::warn!("lan: no local_reg");
            return Err(STATUS_BAD_REQUEST);
        };
        let uri = reg.get("uri").and_then(Value::as_str).ok_or(STATUS_BAD_REQUEST)?;
        let addr = reg
            .get("ip")
            .and_then(Value::as_str)
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
            .ok_or(STATUS_BAD_REQUEST)?;
        let port = reg
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or(STATUS_BAD_REQUEST)?;
        Ok(Self {
            addr,
            port,
            uri: uri.to_string(),
            notify: reg.get("notify").and_then(Value::as_i64).map_or(true, |notify| notify != 0),
            public_key: reg.get("key").and_then(Value::as_str).map(str::to_string),
        })
    }
}
