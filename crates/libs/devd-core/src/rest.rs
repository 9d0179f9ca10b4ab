//! Reverse-REST commands: requests the cloud or a LAN client makes of the
//! device, answered with a status and optional JSON body.

use crate::app::{AppOutbox, ReqId};
use crate::config::LanConfig;
use crate::error::ErrType;
use crate::gateway::{
    address_to_dsn, join_prop_name, split_name, NodeCommand, NodeDriver, NodeMap, PROTO_GATEWAY,
};
use crate::http::{
    HttpMethod, HttpRequest, STATUS_ACCEPTED, STATUS_BAD_REQUEST, STATUS_INTERNAL_ERROR, STATUS_NO_CONTENT,
    STATUS_NOT_FOUND, STATUS_OK, STATUS_PRECONDITION_FAILED, STATUS_UNAVAILABLE,
};
use crate::link::CloudLink;
use crate::ops::ota::OtaImage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const STATUS_FORBIDDEN: u16 = 403;
/// How long a LAN property read waits for the application.
pub const PROP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const API_VERSION: &str = "1.0";

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Ads,
    Lan(u8),
}

impl Origin {
    fn is_lan(self) -> bool {
        matches!(self, Self::Lan(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevError {
    #[error("command missing {0}")]
    Missing(&'static str),
    #[error("unsupported method {0}")]
    Method(String),
}

/// One parsed command object.
#[derive(Debug, Clone, PartialEq)]
pub struct RevRequest {
    pub cmd_id: i64,
    pub method: HttpMethod,
    pub resource: String,
    pub query: Vec<(String, String)>,
    pub resp_uri: String,
    pub data: Option<String>,
    pub origin: Origin,
}

impl RevRequest {
    pub fn parse(cmd: &Value, origin: Origin) -> Result<Self, RevError> {
        let resource = cmd.get("resource").and_then(Value::as_str).ok_or(RevError::Missing("resource"))?;
        let cmd_id = cmd
            .get("id")
            .or_else(|| cmd.get("cmd_id"))
            .and_then(Value::as_i64)
            .ok_or(RevError::Missing("id"))?;
        let resp_uri = cmd.get("uri").and_then(Value::as_str).ok_or(RevError::Missing("uri"))?;
        let method_name = cmd.get("method").and_then(Value::as_str).unwrap_or("GET");
        let method = HttpMethod::parse(method_name).ok_or_else(|| RevError::Method(method_name.to_string()))?;
        let data = cmd
            .get("data")
            .and_then(Value::as_str)
            .filter(|data| !data.is_empty() && *data != "none")
            .map(str::to_string);

        let resource = resource.trim_start_matches('/');
        let (path, query) = match resource.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (resource, Vec::new()),
        };
        Ok(Self {
            cmd_id,
            method,
            resource: path.to_string(),
            query,
            resp_uri: resp_uri.to_string(),
            data,
            origin,
        })
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// The command body as JSON, if it carried one that parses.
    pub fn body(&self) -> Option<Value> {
        self.data.as_deref().and_then(|data| serde_json::from_str(data).ok())
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevReply {
    pub status: u16,
    pub body: Option<Value>,
}

impl RevReply {
    pub fn status(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body: Some(body) }
    }

    /// Cloud reply: `PUT devices/<key><uri>?cmd_id=N&status=S`.
    pub fn to_ads_request(&self, link: &CloudLink, cmd_id: i64, resp_uri: &str) -> HttpRequest {
        let url = format!("{}?cmd_id={cmd_id}&status={}", link.device_url(resp_uri.trim_start_matches('/')), self.status);
        link.request(HttpMethod::Put, url).json(self.body.clone().unwrap_or_else(|| json!({})))
    }

    /// Path and query for the LAN reply POST.
    pub fn lan_uri(&self, cmd_id: i64, resp_uri: &str) -> String {
        format!("{resp_uri}?cmd_id={cmd_id}&status={}", self.status)
    }
}

/// Work a command leaves for the daemon once its reply is queued.
#[derive(Debug, Clone, PartialEq)]
pub enum RevEffect {
    CloudInit,
    Reset { factory: bool },
    Ota(Value),
    OtaFetch(String),
    LanIp(LanConfig),
    Registered(bool),
}

/// Device details reported by `status.json` and `time.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub dsn: String,
    pub device_service: String,
    pub version: String,
    pub last_connect_mtime: u64,
    pub last_connect_time: u64,
    /// Milliseconds since the daemon started.
    pub mtime: u64,
    /// Seconds since the epoch.
    pub time: u64,
}

/// What a command may see and touch. The application outbox doubles as the
/// [`NodeDriver`] for commands addressed to nodes.
pub struct RevContext<'a> {
    pub app: &'a mut AppOutbox,
    pub effects: &'a mut Vec<RevEffect>,
    pub status: &'a DeviceStatus,
    pub nodes: &'a NodeMap,
    pub now: Instant,
}

/// Reply now, later once the application answers, or never: forwarded node
/// commands are answered by the application's result op.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Reply(RevReply),
    Pending,
    Forwarded,
}

/// The application answer a pending command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Prop,
    NodeProp,
    ConnStatus,
}

#[derive(Debug, Clone)]
struct PendingProp {
    request: RevRequest,
    awaiting: Awaiting,
    deadline: Instant,
}

/// Routes commands and tracks the ones waiting on the application.
#[derive(Debug, Default)]
pub struct RevServer {
    pending: HashMap<ReqId, PendingProp>,
}

impl RevServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn handle(&mut self, req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
        log::debug!("rest: {:?} {} {} from {:?}", req.cmd_id, req.method, req.resource, req.origin);
        let reply = match (req.method, req.resource.as_str()) {
            (HttpMethod::Put, "lanip.json") => ads_only(req, |req| put_lanip(req, ctx)),
            (HttpMethod::Put, "getdsns.json") => ads_only(req, |_| {
                ctx.effects.push(RevEffect::CloudInit);
                RevReply::status(STATUS_ACCEPTED)
            }),
            (HttpMethod::Put, "reset.json") => {
                let factory = matches!(req.query_param("factory"), Some("1" | "true"));
                ctx.effects.push(RevEffect::Reset { factory });
                RevReply::status(STATUS_ACCEPTED)
            }
            (HttpMethod::Put, "registration.json") if req.origin == Origin::Ads => return put_registration(req, ctx),
            (HttpMethod::Put, "registration.json") => RevReply::status(STATUS_FORBIDDEN),
            (HttpMethod::Get, "status.json") => RevReply::json(STATUS_OK, status_body(ctx.status)),
            (HttpMethod::Get, "time.json") => RevReply::json(
                STATUS_OK,
                json!({"time": ctx.status.time, "mtime": ctx.status.mtime, "set_at_mtime": 0}),
            ),
            (HttpMethod::Put, "ota.json") => ads_only(req, |req| put_ota(req, ctx)),
            (HttpMethod::Get, "property.json") if req.origin.is_lan() => return self.get_property(req, ctx),
            (HttpMethod::Get, "property.json") => RevReply::status(STATUS_FORBIDDEN),
            (HttpMethod::Get, "node_property.json") if req.origin.is_lan() => return self.get_node_property(req, ctx),
            (HttpMethod::Get, "conn_status.json") if req.origin.is_lan() => return self.get_conn_status(req, ctx),
            (HttpMethod::Get, "node_property.json" | "conn_status.json") => RevReply::status(STATUS_FORBIDDEN),
            (HttpMethod::Put, "reset_node.json") => return put_reset_node(req, ctx),
            (HttpMethod::Put, "node_ota.json") if req.origin == Origin::Ads => return put_node_ota(req, ctx),
            (HttpMethod::Put, "node_ota.json") => RevReply::status(STATUS_FORBIDDEN),
            _ => {
                log::info!("rest: no handler for {} {}", req.method, req.resource);
                RevReply::status(STATUS_NOT_FOUND)
            }
        };
        Dispatch::Reply(reply)
    }

    fn get_property(&mut self, req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
        let Some(name) = req.query_param("name").filter(|name| !name.is_empty()) else {
            return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
        };
        let data = req.data.as_ref().map(|data| Value::String(data.clone()));
        let id = ctx.app.prop_request(name, data.as_ref());
        self.wait(id, req, Awaiting::Prop, ctx.now)
    }

    fn get_node_property(&mut self, req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
        let Some((subdevice, template, name)) = req.query_param("name").and_then(|name| split_name(name).ok())
        else {
            return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
        };
        let Some(dsn) = req.body().and_then(|body| body.get("dsn").and_then(Value::as_str).map(str::to_string))
        else {
            return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
        };
        let Some(address) = ctx.nodes.address(&dsn) else {
            log::warn!("rest: property read for unknown node {dsn}");
            return Dispatch::Reply(RevReply::status(STATUS_PRECONDITION_FAILED));
        };
        let prop = json!({"address": address, "subdevice_key": subdevice, "template_key": template, "name": name});
        let id = ctx.app.prop_get(prop);
        self.wait(id, req, Awaiting::NodeProp, ctx.now)
    }

    fn get_conn_status(&mut self, req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
        let Some(dsns) = req.body().and_then(|body| body.get("dsns").cloned()) else {
            return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
        };
        let Some(dsns) = dsns.as_array() else {
            return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
        };
        let mut addresses = Vec::new();
        for dsn in dsns {
            let Some(dsn) = dsn.as_str() else {
                return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
            };
            match ctx.nodes.address(dsn) {
                Some(address) => addresses.push(address.to_string()),
                None => log::debug!("rest: conn status for unknown node {dsn}"),
            }
        }
        if addresses.is_empty() {
            return Dispatch::Reply(RevReply::status(STATUS_BAD_REQUEST));
        }
        let id = ctx.app.query_info(&addresses);
        self.wait(id, req, Awaiting::ConnStatus, ctx.now)
    }

    fn wait(&mut self, id: ReqId, req: &RevRequest, awaiting: Awaiting, now: Instant) -> Dispatch {
        let pending = PendingProp { request: req.clone(), awaiting, deadline: now + PROP_REQUEST_TIMEOUT };
        self.pending.insert(id, pending);
        Dispatch::Pending
    }

    fn take(&mut self, id: ReqId, awaiting: Awaiting) -> Option<RevRequest> {
        if self.pending.get(&id)?.awaiting != awaiting {
            log::warn!("rest: answer {id} does not match its request");
            return None;
        }
        self.pending.remove(&id).map(|pending| pending.request)
    }

    /// Matches an application `prop_resp` against a waiting property read.
    /// Returns `None` when nobody was waiting on `id`.
    pub fn prop_response(&mut self, id: ReqId, args: Option<&Value>) -> Option<(RevRequest, RevReply)> {
        let request = self.take(id, Awaiting::Prop)?;
        let first = args.and_then(Value::as_array).and_then(|args| args.first());
        let reply = match first.filter(|arg| arg.is_object()) {
            None => RevReply::status(STATUS_INTERNAL_ERROR),
            Some(arg) => match arg.get("property") {
                Some(prop) => RevReply::json(STATUS_OK, json!({"property": prop})),
                None => RevReply::status(STATUS_NOT_FOUND),
            },
        };
        Some((request, reply))
    }

    /// Matches a `gateway` `prop_resp` against a waiting node property read.
    /// The reply carries the property in cloud form.
    pub fn node_prop_response(
        &mut self,
        id: ReqId,
        args: Option<&Value>,
        nodes: &NodeMap,
        app: &mut AppOutbox,
    ) -> Option<(RevRequest, RevReply)> {
        let request = self.take(id, Awaiting::NodeProp)?;
        let Some(args) = args.and_then(Value::as_array) else {
            app.nak(PROTO_GATEWAY, ErrType::InvalidArgs, id);
            return Some((request, RevReply::status(STATUS_INTERNAL_ERROR)));
        };
        let Some(mut prop) = args.first().and_then(|arg| arg.get("property")).cloned() else {
            return Some((request, RevReply::status(STATUS_INTERNAL_ERROR)));
        };
        if prop.get("status").and_then(Value::as_str) == Some(ErrType::UnknownProp.as_str()) {
            return Some((request, RevReply::status(STATUS_NOT_FOUND)));
        }
        let reply = match address_to_dsn(&mut prop, nodes).and_then(|()| join_prop_name(&mut prop)) {
            Ok(_) => RevReply::json(STATUS_OK, prop),
            Err(err) => {
                log::warn!("rest: node property answer unusable: {err}");
                RevReply::status(STATUS_INTERNAL_ERROR)
            }
        };
        Some((request, reply))
    }

    /// Matches a `conn_status_resp` against a waiting connection status read.
    pub fn conn_status_response(
        &mut self,
        id: ReqId,
        args: Option<&Value>,
        nodes: &NodeMap,
        app: &mut AppOutbox,
    ) -> Option<(RevRequest, RevReply)> {
        let request = self.take(id, Awaiting::ConnStatus)?;
        let Some(mut statuses) = args.filter(|args| args.is_array()).cloned() else {
            app.nak(PROTO_GATEWAY, ErrType::InvalidArgs, id);
            return Some((request, RevReply::status(STATUS_INTERNAL_ERROR)));
        };
        let converted = statuses
            .as_array_mut()
            .map_or(Ok(()), |entries| entries.iter_mut().try_for_each(|entry| address_to_dsn(entry, nodes)));
        let reply = match converted {
            Ok(()) => RevReply::json(STATUS_OK, json!({"connection": statuses})),
            Err(err) => {
                log::warn!("rest: conn status answer unusable: {err}");
                RevReply::status(STATUS_INTERNAL_ERROR)
            }
        };
        Some((request, reply))
    }

    /// Drops property reads the application left unanswered.
    pub fn expire(&mut self, now: Instant) -> Vec<(RevRequest, RevReply)> {
        let expired: Vec<ReqId> =
            self.pending.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| *id).collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|pending| {
                log::warn!("rest: property read {} timed out", pending.request.cmd_id);
                (pending.request, RevReply::status(STATUS_UNAVAILABLE))
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }
}

fn ads_only(req: &RevRequest, handler: impl FnOnce(&RevRequest) -> RevReply) -> RevReply {
    if req.origin != Origin::Ads {
        log::warn!("rest: {} refused from {:?}", req.resource, req.origin);
        return RevReply::status(STATUS_FORBIDDEN);
    }
    handler(req)
}

fn put_lanip(req: &RevRequest, ctx: &mut RevContext<'_>) -> RevReply {
    let Some(lanip) = req.body().and_then(|body| body.get("lanip").cloned()) else {
        return RevReply::status(STATUS_BAD_REQUEST);
    };
    match LanConfig::from_lanip(&lanip) {
        Ok(lan) => {
            ctx.effects.push(RevEffect::LanIp(lan));
            RevReply::status(STATUS_OK)
        }
        Err(err) => {
            log::warn!("rest: lanip rejected: {err}");
            RevReply::status(STATUS_BAD_REQUEST)
        }
    }
}

fn node_command(req: &RevRequest, address: &str, body: Value) -> NodeCommand {
    NodeCommand { address: address.to_string(), cmd_id: req.cmd_id, cmd_uri: req.resp_uri.clone(), cmd_data: body }
}

fn reply(status: u16) -> Dispatch {
    Dispatch::Reply(RevReply::status(status))
}

fn put_registration(req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
    let Some(body) = req.body() else {
        return reply(STATUS_BAD_REQUEST);
    };
    let Some(reg) = body.get("registration").filter(|reg| reg.is_object()) else {
        return reply(STATUS_BAD_REQUEST);
    };
    if let Some(dsn) = reg.get("dsn").and_then(Value::as_str) {
        if dsn != ctx.status.dsn {
            // registration change of a node
            let Some(address) = ctx.nodes.address(dsn) else {
                log::info!("rest: registration change for unknown node {dsn}");
                return reply(STATUS_OK);
            };
            ctx.app.configure(&node_command(req, address, body.clone()));
            return Dispatch::Forwarded;
        }
    }
    let Some(status) = reg.get("status").and_then(Value::as_i64) else {
        return reply(STATUS_BAD_REQUEST);
    };
    ctx.effects.push(RevEffect::Registered(status != 0));
    reply(STATUS_NO_CONTENT)
}

fn put_reset_node(req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
    let Some(body) = req.body().filter(Value::is_object) else {
        return reply(STATUS_BAD_REQUEST);
    };
    let dsn = body.get("dsn").and_then(Value::as_str).unwrap_or_default();
    let Some(address) = ctx.nodes.address(dsn) else {
        // a node that is gone already counts as reset
        log::warn!("rest: reset of unknown node {dsn:?}");
        return reply(STATUS_OK);
    };
    ctx.app.leave(&node_command(req, address, body.clone()));
    Dispatch::Forwarded
}

/// Node named by the `dsn` query argument of the image URL.
fn node_ota_dsn(ota: &Value) -> Option<String> {
    let (_, query) = ota.get("url")?.as_str()?.split_once('?')?;
    parse_query(query).into_iter().find(|(key, _)| key == "dsn").map(|(_, dsn)| dsn)
}

fn put_node_ota(req: &RevRequest, ctx: &mut RevContext<'_>) -> Dispatch {
    let Some(body) = req.body().filter(Value::is_object) else {
        return reply(STATUS_BAD_REQUEST);
    };
    let Some(ota) = body.get("ota").filter(|ota| ota.is_object()) else {
        return reply(STATUS_BAD_REQUEST);
    };
    let Some(dsn) = node_ota_dsn(ota) else {
        return reply(STATUS_BAD_REQUEST);
    };
    let Some(address) = ctx.nodes.address(&dsn) else {
        log::warn!("rest: OTA for unknown node {dsn}");
        return reply(STATUS_NOT_FOUND);
    };
    let version = ota.get("ver").and_then(Value::as_str);
    ctx.app.ota_update(&node_command(req, address, body.clone()), version);
    Dispatch::Forwarded
}

fn put_ota(req: &RevRequest, ctx: &mut RevContext<'_>) -> RevReply {
    let Some(ota) = req.body().and_then(|body| body.get("ota").cloned()).filter(Value::is_object) else {
        return RevReply::status(STATUS_BAD_REQUEST);
    };
    match ota.get("source").and_then(Value::as_str) {
        Some(source) if source != "local" => {
            ctx.effects.push(RevEffect::OtaFetch(source.to_string()));
            RevReply::status(STATUS_OK)
        }
        _ if OtaImage::from_value(&ota).is_some() => {
            ctx.effects.push(RevEffect::Ota(ota));
            RevReply::status(STATUS_OK)
        }
        _ => {
            log::warn!("rest: unusable ota object");
            RevReply::status(STATUS_INTERNAL_ERROR)
        }
    }
}

fn status_body(status: &DeviceStatus) -> Value {
    json!({
        "dsn": status.dsn,
        "device_service": status.device_service,
        "last_connect_mtime": status.last_connect_mtime,
        "last_connect_time": status.last_connect_time,
        "mtime": status.mtime,
        "version": status.version,
        "features": [],
        "build": status.version,
        "api_version": API_VERSION,
    })
}
