//! Runtime pieces of the `devd` daemon that are worth testing outside the
//! binary: the shared daemon handle, the reqwest-backed HTTP client, the
//! LAN registration endpoint and the OTA command runner.

pub mod daemon;
pub mod http_client;
pub mod lan_http;
pub mod ota;

pub use daemon::Daemon;
pub use http_client::ReqwestClient;
