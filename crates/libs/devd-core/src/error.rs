use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised by the daemon core.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum DevdError {
    #[error("config error: {message}")]
    Config { message: String },

    #[error("http transport error: {message}")]
    Transport { message: String },

    #[error("cloud returned status {status}")]
    CloudStatus { status: u16 },

    #[error("bad cloud response: {message}")]
    BadResponse { message: String },

    #[error("lan error: {0}")]
    Lan(#[from] crate::lan::LanError),

    #[error("notify error: {message}")]
    Notify { message: String },

    #[error("app protocol error: {0}")]
    App(ErrType),

    #[error("message transport error: {0}")]
    Msg(#[from] amsg::AmsgError),
}

impl DevdError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Notify { .. } => true,
            Self::CloudStatus { status } => matches!(status, 429 | 503 | 504),
            Self::Msg(err) => !err.is_fatal(),
            _ => false,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn bad_response(message: impl Into<String>) -> Self {
        Self::BadResponse { message: message.into() }
    }
}

/// Error kinds reported to local applications in the JSON interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrType {
    #[serde(rename = "conn_err")]
    ConnErr,
    #[serde(rename = "unknown_prop")]
    UnknownProp,
    #[serde(rename = "bad_value")]
    BadValue,
    #[serde(rename = "unknown_err")]
    Unknown,
    #[serde(rename = "invalid_args")]
    InvalidArgs,
    #[serde(rename = "invalid_json")]
    InvalidJson,
    #[serde(rename = "invalid_op")]
    InvalidOp,
    #[serde(rename = "unknown_protocol")]
    UnknownProtocol,
    #[serde(rename = "mem_err")]
    Mem,
}

impl ErrType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnErr => "conn_err",
            Self::UnknownProp => "unknown_prop",
            Self::BadValue => "bad_value",
            Self::Unknown => "unknown_err",
            Self::InvalidArgs => "invalid_args",
            Self::InvalidJson => "invalid_json",
            Self::InvalidOp => "invalid_op",
            Self::UnknownProtocol => "unknown_protocol",
            Self::Mem => "mem_err",
        }
    }

    /// Maps a failed cloud HTTP status to the kind reported upstream.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::UnknownProp,
            422 => Self::BadValue,
            _ => Self::ConnErr,
        }
    }
}

impl fmt::Display for ErrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_type_serializes_as_interface_string() {
        let value = serde_json::to_value(ErrType::BadValue).expect("serialize");
        assert_eq!(value, serde_json::json!("bad_value"));
        assert_eq!(ErrType::from_status(404), ErrType::UnknownProp);
        assert_eq!(ErrType::from_status(422), ErrType::BadValue);
        assert_eq!(ErrType::from_status(500), ErrType::ConnErr);
    }

    #[test]
    fn throttling_statuses_are_retryable() {
        assert!(DevdError::CloudStatus { status: 503 }.is_retryable());
        assert!(!DevdError::CloudStatus { status: 404 }.is_retryable());
        assert!(!DevdError::config("bad").is_retryable());
    }
}
