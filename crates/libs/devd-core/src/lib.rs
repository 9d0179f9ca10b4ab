//! Core of the gateway device daemon.
//!
//! Every subsystem here is a state machine without I/O: the cloud client
//! ([`ds`]), the serialized operation queue ([`ops`]), the LAN secure channel
//! ([`lan`]), the push-notification client ([`notify`]) and the node gateway
//! ([`gateway`]). [`DaemonContext`]
//! connects them; the daemon binary owns the sockets, HTTP clients and timers
//! and drives the context.

pub mod app;
mod backoff;
pub mod config;
pub mod context;
pub mod dests;
pub mod ds;
pub mod gateway;
pub mod error;
pub mod http;
pub mod lan;
pub mod link;
pub mod notify;
pub mod ops;
pub mod props;
pub mod registry;
pub mod rest;

pub use backoff::{ping_retry_delay, random_jitter};
pub use config::DevdConfig;
pub use context::{DaemonContext, DaemonOutput, LanDelivery, LanRequest, LanRequestKind, OpWork};
pub use dests::{DestMask, Source};
pub use error::{DevdError, ErrType};
pub use http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse};
