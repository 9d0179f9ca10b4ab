//! Request/response messaging over `SOCK_SEQPACKET` Unix sockets.
//!
//! Every datagram carries a 12-byte [`Header`] and an optional payload.
//! Replies are matched to requests by sequence number; synchronous requests
//! carry a private reply socket as `SCM_RIGHTS` ancillary data so their reply
//! never shares the main channel with asynchronous traffic.
//!
//! Endpoints are single-threaded (`Rc` based) and expect to be driven from a
//! tokio `LocalSet`.

pub mod endpoint;
pub mod error;
pub mod interface;
pub mod responder;
pub mod server;
mod sys;
pub mod wire;

pub use endpoint::{Endpoint, ReplyCallback};
pub use error::AmsgError;
pub use interface::{
    DefaultResponse, InterfaceHandler, Interfaces, INTERNAL_INTERFACE, MSG_DEFAULT_RESP,
    MSG_PING, MSG_PING_RESP,
};
pub use responder::{AsyncResponse, Responder};
pub use server::{Server, SessionCallback, SessionEvent};
pub use wire::{Flags, Header, Message, HEADER_LEN, MAX_MSG_SIZE};
