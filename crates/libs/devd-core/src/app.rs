//! JSON interface spoken with local applications over the message socket.
//!
//! Every message is an object `{"cmd": {"proto", "id", "op", "args", "opts"}}`.
//! Replies to an application request reuse its id; unsolicited messages take the
//! next id from the outbox counter.

use crate::dests::{DestMask, Source};
use crate::error::ErrType;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;

/// Client control interface.
pub const IFACE_CLIENT: u8 = 1;
pub const CLIENT_LISTEN_ENABLE: u8 = 1;
pub const CLIENT_DESTS_REQ: u8 = 2;
pub const CLIENT_DESTS_REG: u8 = 3;
pub const CLIENT_DESTS: u8 = 4;

/// JSON data interface.
pub const IFACE_DATA: u8 = 2;
pub const DATA_JSON: u8 = 1;

pub const PROTO_DATA: &str = "data";

pub const OP_ACK: &str = "ack";
pub const OP_NAK: &str = "nak";
pub const OP_ERROR: &str = "error";
pub const OP_CONFIRM_TRUE: &str = "confirm_true";
pub const OP_CONFIRM_FALSE: &str = "confirm_false";
pub const OP_ECHO_FAILURE: &str = "echo_failure";
pub const OP_PROP_SEND: &str = "prop_send";
pub const OP_PROP_BATCH_SEND: &str = "prop_batch_send";
pub const OP_PROP_REQ: &str = "prop_req";
pub const OP_PROP_RESP: &str = "prop_resp";
pub const OP_PROP_UPDATE: &str = "prop_update";
pub const OP_FILE_DP_CREATE: &str = "file_dp_create";
pub const OP_FILE_DP_SEND: &str = "file_dp_send";
pub const OP_FILE_DP_FETCHED: &str = "file_dp_fetched";
pub const OP_FILE_DP_REQ: &str = "file_dp_req";
pub const OP_FILE_DP_LOCATION: &str = "file_dp_location";

/// Request ids are never zero: zero tells the peer to accept any id.
pub type ReqId = i32;

/// A decoded application request.
#[derive(Debug, Clone, PartialEq)]
pub struct AppRequest {
    pub proto: String,
    pub id: ReqId,
    pub op: Option<String>,
    pub args: Option<Value>,
    pub opts: RequestOpts,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOpts {
    pub confirm: bool,
    pub echo: bool,
    pub source: Source,
    /// Raw `dests` option, absent when the application did not pick destinations.
    pub dests: Option<i64>,
}

impl RequestOpts {
    pub fn from_value(opts: Option<&Value>) -> Self {
        let Some(opts) = opts.and_then(Value::as_object) else {
            return Self::default();
        };
        let flag = |key: &str| match opts.get(key) {
            Some(Value::Bool(value)) => *value,
            Some(Value::Number(value)) => value.as_i64().unwrap_or(0) != 0,
            _ => false,
        };
        Self {
            confirm: flag("confirm"),
            echo: flag("echo"),
            source: opts
                .get("source")
                .and_then(Value::as_u64)
                .and_then(|source| Source::try_from(source).ok())
                .unwrap_or_default(),
            dests: opts.get("dests").and_then(Value::as_i64),
        }
    }
}

impl AppRequest {
    /// Decodes one datagram. Anything without a `cmd` object carrying a
    /// string `proto` and an integer `id` is `invalid_json`.
    pub fn parse(payload: &[u8]) -> Result<Self, ErrType> {
        let root: Value = serde_json::from_slice(payload).map_err(|_| ErrType::InvalidJson)?;
        let cmd = root.get("cmd").and_then(Value::as_object).ok_or(ErrType::InvalidJson)?;
        let proto = cmd.get("proto").and_then(Value::as_str).ok_or(ErrType::InvalidJson)?;
        let id = cmd
            .get("id")
            .and_then(Value::as_i64)
            .and_then(|id| ReqId::try_from(id).ok())
            .ok_or(ErrType::InvalidJson)?;
        Ok(Self {
            proto: proto.to_string(),
            id,
            op: cmd.get("op").and_then(Value::as_str).map(str::to_string),
            args: cmd.get("args").cloned(),
            opts: RequestOpts::from_value(cmd.get("opts")),
        })
    }

    /// Replies the daemon never acts on.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.op.as_deref(),
            Some(OP_ACK | OP_NAK | OP_ERROR | OP_CONFIRM_TRUE | OP_CONFIRM_FALSE)
        )
    }
}

/// Builds `{"cmd": {"proto", "id", "op"}}`.
pub fn new_cmd(proto: &str, op: &str, id: ReqId) -> Value {
    json!({"cmd": {"proto": proto, "id": id, "op": op}})
}

fn cmd_mut(root: &mut Value) -> Option<&mut Map<String, Value>> {
    root.get_mut("cmd").and_then(Value::as_object_mut)
}

pub(crate) fn set_args(root: &mut Value, args: Value) {
    if let Some(cmd) = cmd_mut(root) {
        cmd.insert("args".to_string(), args);
    }
}

pub(crate) fn set_opt(root: &mut Value, key: &str, value: Value) {
    if let Some(cmd) = cmd_mut(root) {
        let opts = cmd.entry("opts").or_insert_with(|| Value::Object(Map::new()));
        if let Some(opts) = opts.as_object_mut() {
            opts.insert(key.to_string(), value);
        }
    }
}

/// Error object carried in NAK, echo-failure and confirm-false args.
/// Keys are only present when they carry information.
pub fn error_object(
    name: Option<&str>,
    dests: DestMask,
    err: Option<ErrType>,
    op: Option<&str>,
    op_args: Option<&Value>,
) -> Value {
    let mut error = Map::new();
    if let Some(err) = err {
        error.insert("err".to_string(), json!(err.as_str()));
    }
    if let Some(name) = name {
        error.insert("name".to_string(), json!(name));
    }
    if !dests.is_empty() {
        error.insert("dests".to_string(), json!(dests.bits()));
    }
    if let Some(op) = op {
        error.insert("op".to_string(), json!(op));
    }
    if let Some(op_args) = op_args {
        error.insert("op_args".to_string(), op_args.clone());
    }
    Value::Object(error)
}

/// Outbound messages for the listening application plus the unsolicited id counter.
#[derive(Debug)]
pub struct AppOutbox {
    next_id: ReqId,
    queue: VecDeque<Value>,
}

impl Default for AppOutbox {
    fn default() -> Self {
        Self { next_id: 1, queue: VecDeque::new() }
    }
}

impl AppOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for the next unsolicited message and advances the counter.
    pub fn take_id(&mut self) -> ReqId {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }

    pub fn peek_id(&self) -> ReqId {
        self.next_id
    }

    pub fn push(&mut self, message: Value) {
        log::debug!("app: queue {message}");
        self.queue.push_back(message);
    }

    pub fn drain(&mut self) -> Vec<Value> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn ack(&mut self, proto: &str, id: ReqId) {
        self.push(new_cmd(proto, OP_ACK, id));
    }

    pub fn nak(&mut self, proto: &str, err: ErrType, id: ReqId) {
        let mut root = new_cmd(proto, OP_NAK, id);
        set_args(&mut root, json!([{"err": err.as_str()}]));
        self.push(root);
    }

    pub fn nak_with_args(&mut self, proto: &str, args: Value, id: ReqId) {
        let mut root = new_cmd(proto, OP_NAK, id);
        set_args(&mut root, args);
        self.push(root);
    }

    pub fn echo_failure(&mut self, proto: &str, args: Value) {
        let id = self.take_id();
        let mut root = new_cmd(proto, OP_ECHO_FAILURE, id);
        set_args(&mut root, args);
        self.push(root);
    }

    pub fn confirm_true(&mut self, proto: &str, id: ReqId) {
        self.push(new_cmd(proto, OP_CONFIRM_TRUE, id));
    }

    pub fn confirm_false(&mut self, proto: &str, id: ReqId, dests: DestMask, err: Option<ErrType>) {
        let mut root = new_cmd(proto, OP_CONFIRM_FALSE, id);
        set_args(&mut root, json!([error_object(None, dests, err, None, None)]));
        self.push(root);
    }

    /// General error not tied to a request.
    pub fn error(&mut self, err: ErrType) {
        let id = self.take_id();
        let mut root = new_cmd(PROTO_DATA, OP_ERROR, id);
        set_args(&mut root, json!([{"err": err.as_str()}]));
        self.push(root);
    }

    pub fn prop_resp(&mut self, proto: &str, id: ReqId, props: Value, source: Source) {
        let mut root = new_cmd(proto, OP_PROP_RESP, id);
        set_args(&mut root, props);
        if source != 0 {
            set_opt(&mut root, "source", json!(source));
        }
        self.push(root);
    }

    /// Property changes coming from the cloud or a LAN client.
    pub fn prop_update(&mut self, props: Value, source: Source) {
        let id = self.take_id();
        let mut root = new_cmd(PROTO_DATA, OP_PROP_UPDATE, id);
        set_args(&mut root, props);
        if source != 0 {
            set_opt(&mut root, "source", json!(source));
        }
        self.push(root);
    }

    /// Asks the application for the current value of `name`. Returns the request id
    /// the matching `prop_resp` will carry.
    pub fn prop_request(&mut self, name: &str, data: Option<&Value>) -> ReqId {
        let id = self.take_id();
        let mut prop = json!({"name": name});
        if let Some(data) = data {
            prop["data"] = json!(data.to_string());
        }
        let mut root = new_cmd(PROTO_DATA, OP_PROP_REQ, id);
        set_args(&mut root, json!([prop]));
        self.push(root);
        id
    }

    pub fn file_dp_location(&mut self, id: ReqId, name: &str, location: &str) {
        let mut root = new_cmd(PROTO_DATA, OP_FILE_DP_LOCATION, id);
        set_args(&mut root, json!([{"property": {"name": name, "location": location}}]));
        self.push(root);
    }
}
