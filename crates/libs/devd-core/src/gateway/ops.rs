//! Queued gateway commands.
//!
//! Node identities are resolved in [`Command::prepare`], so a command naming
//! an unknown node fails before anything is delivered.

use super::nodes::{address_to_dsn, is_valid_dsn, prop_to_cloud, props_to_app, NodeError};
use super::{
    OP_CONN_STATUS, OP_NODE_ADD, OP_NODE_OTA_LOCAL_FETCH, OP_NODE_OTA_REMOTE_FETCH, OP_NODE_OTA_RESULT,
    OP_NODE_OTA_URL_FETCH, OP_NODE_REG_RESULT, OP_NODE_REMOVE, OP_NODE_RST_RESULT, OP_NODE_UPDATE, OP_PROP_ACK,
    OP_PROP_REQ_ALL, OP_PROP_REQ_TO_DEV, PROTO_GATEWAY,
};
use crate::app::{OP_PROP_BATCH_SEND, OP_PROP_REQ, OP_PROP_SEND};
use crate::dests::{DestMask, SOURCE_ADS};
use crate::error::ErrType;
use crate::http::{HttpMethod, HttpResponse, STATUS_BAD_REQUEST, STATUS_NOT_ACCEPTABLE, STATUS_OK};
use crate::ops::prop::BatchSend;
use crate::ops::{Command, InitOutcome, LanPayload, OpCmd, OpContext, OpEvent, StepOutcome};
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const LAN_CONN_STATUS_URL: &str = "node/conn_status.json";
pub const LAN_NODE_PROP_SEND_URL: &str = "node/property/datapoint.json";
pub const LAN_NODE_PROP_ACK_URL: &str = "node/property/datapoint/ack.json";
const BATCH_NODE_DPS: &str = "batch_datapoints.json?nodes=1";

fn unresolved(err: NodeError) -> ErrType {
    log::warn!("gateway: {err}");
    ErrType::Unknown
}

fn int_field(info: &Value, key: &str) -> Option<i64> {
    match info.get(key)? {
        Value::Bool(flag) => Some(i64::from(*flag)),
        value => value.as_i64(),
    }
}

fn str_field<'a>(info: &'a Value, key: &str) -> Option<&'a str> {
    info.get(key).and_then(Value::as_str)
}

/// Registers a node with the cloud, which answers with the node's DSN.
pub struct NodeAdd {
    info: Value,
}

impl NodeAdd {
    pub fn new(info: Value) -> Self {
        Self { info }
    }
}

impl Command for NodeAdd {
    fn name(&self) -> &'static str {
        OP_NODE_ADD
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        InitOutcome::Send(ctx.link.request(HttpMethod::Post, ctx.link.dsn_url("nodes.json")).json(self.info.clone()))
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(device) = resp.json().and_then(|body| body.get("device").cloned()) else {
            log::warn!("gateway: missing device object");
            return StepOutcome::Failed(ErrType::Unknown);
        };
        let (Some(address), Some(dsn)) = (str_field(&device, "address"), str_field(&device, "dsn")) else {
            log::warn!("gateway: missing node address or dsn");
            return StepOutcome::Failed(ErrType::Unknown);
        };
        if !is_valid_dsn(dsn) {
            log::warn!("gateway: invalid dsn {dsn:?} from cloud");
            return StepOutcome::Failed(ErrType::Unknown);
        }
        log::info!("gateway: add node {dsn} -> {address}");
        ctx.events.push(OpEvent::NodeMapped { dsn: dsn.to_string(), address: address.to_string() });
        StepOutcome::Done
    }
}

/// Updates the cloud record of a registered node.
pub struct NodeUpdate {
    info: Value,
    address: String,
    dsn: String,
}

impl NodeUpdate {
    pub fn new(info: Value, address: impl Into<String>) -> Self {
        Self { info, address: address.into(), dsn: String::new() }
    }
}

impl Command for NodeUpdate {
    fn name(&self) -> &'static str {
        OP_NODE_UPDATE
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        self.dsn = ctx.nodes.dsn_for(&self.address).map_err(unresolved)?.to_string();
        Ok(())
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let url = ctx.link.dsn_url(&format!("nodes/{}.json", self.dsn));
        InitOutcome::Send(ctx.link.request(HttpMethod::Put, url).json(self.info.clone()))
    }
}

/// Deletes a node from the cloud and forgets its mapping.
pub struct NodeRemove {
    address: String,
    dsn: String,
}

impl NodeRemove {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), dsn: String::new() }
    }
}

impl Command for NodeRemove {
    fn name(&self) -> &'static str {
        OP_NODE_REMOVE
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        self.dsn = ctx.nodes.dsn_for(&self.address).map_err(unresolved)?.to_string();
        Ok(())
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let url = ctx.link.dsn_url(&format!("nodes/{}.json?force_delete=true", self.dsn));
        InitOutcome::Send(ctx.link.request(HttpMethod::Delete, url))
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
        log::info!("gateway: delete node {} -> {}", self.dsn, self.address);
        ctx.events.push(OpEvent::NodeUnmapped { dsn: self.dsn.clone() });
        StepOutcome::Done
    }
}

/// Reports node connection states. LAN clients get the whole list, the
/// cloud the first entry.
pub struct ConnStatus {
    statuses: Value,
}

impl ConnStatus {
    pub fn new(statuses: Value) -> Self {
        Self { statuses }
    }
}

impl Command for ConnStatus {
    fn name(&self) -> &'static str {
        OP_CONN_STATUS
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        let entries = self.statuses.as_array_mut().ok_or(ErrType::InvalidArgs)?;
        for entry in entries {
            address_to_dsn(entry, ctx.nodes).map_err(unresolved)?;
        }
        Ok(())
    }

    fn lan_payloads(&self, cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        let resource = format!("{LAN_CONN_STATUS_URL}{}", cmd.echo_suffix());
        Some(vec![LanPayload::new(resource, json!({"connection": self.statuses}))])
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        if !cmd.dests_target.has_ads() {
            return InitOutcome::Done;
        }
        let Some(first) = self.statuses.get(0) else {
            return InitOutcome::Done;
        };
        let dsn = str_field(first, "dsn").unwrap_or_default();
        let url = ctx.link.dsn_url(&format!("nodes/{dsn}/conn_status.json"));
        InitOutcome::Send(ctx.link.request(HttpMethod::Put, url).json(json!({"connection": first})))
    }
}

/// Sends one node property datapoint. With `echo` set on the command it
/// repeats an update to the destinations it did not come from. The property
/// name is already in cloud form.
pub struct NodePropSend {
    prop: Value,
    dsn: String,
    name: String,
}

impl NodePropSend {
    pub fn new(prop: Value) -> Self {
        Self { prop, dsn: String::new(), name: String::new() }
    }
}

impl Command for NodePropSend {
    fn name(&self) -> &'static str {
        OP_PROP_SEND
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        address_to_dsn(&mut self.prop, ctx.nodes).map_err(unresolved)?;
        self.dsn = str_field(&self.prop, "dsn").unwrap_or_default().to_string();
        self.name = str_field(&self.prop, "name").unwrap_or_default().to_string();
        Ok(())
    }

    fn lan_payloads(&self, cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        let resource = format!("{LAN_NODE_PROP_SEND_URL}{}", cmd.echo_suffix());
        Some(vec![LanPayload::new(resource, self.prop.clone())])
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        if !cmd.dests_target.has_ads() {
            return InitOutcome::Done;
        }
        let url = ctx
            .link
            .node_url(&self.dsn, &format!("properties/{}/datapoints.json{}", self.name, cmd.echo_suffix()));
        InitOutcome::Send(ctx.link.request(HttpMethod::Post, url).json(json!({"datapoint": self.prop})))
    }
}

/// Batch of node datapoints, posted with `nodes=1`.
pub struct NodeBatchSend {
    batch: BatchSend,
}

impl NodeBatchSend {
    pub fn new(batch: Value) -> Self {
        Self { batch: BatchSend::routed(batch, BATCH_NODE_DPS, LAN_NODE_PROP_SEND_URL) }
    }
}

impl Command for NodeBatchSend {
    fn name(&self) -> &'static str {
        OP_PROP_BATCH_SEND
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        let entries = self.batch.batch_mut().as_array_mut().ok_or(ErrType::InvalidArgs)?;
        for entry in entries {
            let prop = entry.get_mut("property").ok_or_else(|| unresolved(NodeError::Missing("property")))?;
            prop_to_cloud(prop, ctx.nodes).map_err(unresolved)?;
        }
        Ok(())
    }

    fn lan_payloads(&self, cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        self.batch.lan_payloads(cmd)
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        self.batch.init(cmd, ctx)
    }

    fn on_success(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        self.batch.on_success(cmd, ctx, resp)
    }
}

/// Acknowledges a node datapoint that asked for an explicit ack, to the
/// destination the update came from. A successful ack is echoed to the
/// other destinations.
pub struct NodePropAck {
    prop: Value,
    ack_info: Value,
    dsn: String,
    name: String,
    id: String,
}

impl NodePropAck {
    pub fn new(prop: Value) -> Self {
        Self { prop, ack_info: Value::Null, dsn: String::new(), name: String::new(), id: String::new() }
    }

    fn lan_source(cmd: &OpCmd) -> Option<DestMask> {
        (cmd.source != SOURCE_ADS).then(|| DestMask::from_source(cmd.source))
    }
}

impl Command for NodePropAck {
    fn name(&self) -> &'static str {
        OP_PROP_ACK
    }

    fn prepare(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        address_to_dsn(&mut self.prop, ctx.nodes).map_err(unresolved)?;
        let (Some(id), Some(message), Some(name), Some(status)) = (
            str_field(&self.prop, "id"),
            self.prop.get("ack_message").cloned(),
            str_field(&self.prop, "name"),
            int_field(&self.prop, "status"),
        ) else {
            log::warn!("gateway: bad ack info");
            return Err(ErrType::InvalidArgs);
        };
        self.id = id.to_string();
        self.name = name.to_string();
        self.dsn = str_field(&self.prop, "dsn").unwrap_or_default().to_string();
        let ack_status = if status == 0 { STATUS_OK } else { STATUS_BAD_REQUEST };
        self.ack_info = json!({"id": self.id, "ack_status": ack_status, "ack_message": message});
        if let Some(prop) = self.prop.as_object_mut() {
            prop.remove("id");
            prop.remove("status");
            prop.insert("ack_status".to_string(), json!(ack_status));
        }

        let source = DestMask::from_source(cmd.source);
        let targets = cmd.dests_target & !source;
        if let Some(lan) = Self::lan_source(cmd) {
            if !ctx.dests_avail.contains(lan) {
                log::debug!("gateway: no lan client to ack");
                cmd.mark_results(lan, true);
            }
        }
        if !targets.is_empty() && status == 0 {
            cmd.echo = true;
        } else {
            cmd.mark_results(targets, true);
        }
        Ok(())
    }

    fn lan_payloads(&self, cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        let source = DestMask::from_source(cmd.source);
        let mut payloads = Vec::new();
        if let Some(lan) = Self::lan_source(cmd) {
            payloads.push(LanPayload::new(LAN_NODE_PROP_ACK_URL, self.ack_info.clone()).only(lan).best_effort());
        }
        if cmd.echo {
            let resource = format!("{LAN_NODE_PROP_SEND_URL}{}", cmd.echo_suffix());
            payloads.push(LanPayload::new(resource, self.prop.clone()).only(DestMask::LAN_APPS & !source));
        }
        Some(payloads)
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        if !cmd.dests_target.has_ads() {
            return InitOutcome::Done;
        }
        if cmd.source == SOURCE_ADS {
            let url = ctx.link.node_url(&self.dsn, &format!("properties/{}/datapoints/{}.json", self.name, self.id));
            return InitOutcome::Send(
                ctx.link.request(HttpMethod::Put, url).json(json!({"datapoint": self.ack_info})),
            );
        }
        let url = ctx
            .link
            .node_url(&self.dsn, &format!("properties/{}/datapoints.json{}", self.name, cmd.echo_suffix()));
        InitOutcome::Send(ctx.link.request(HttpMethod::Post, url).json(json!({"datapoint": self.prop})))
    }
}

/// Fetches the cloud value of one node property for the application.
pub struct NodePropGet {
    prop: Value,
    dsn: String,
}

impl NodePropGet {
    pub fn new(prop: Value) -> Self {
        Self { prop, dsn: String::new() }
    }
}

impl Command for NodePropGet {
    fn name(&self) -> &'static str {
        OP_PROP_REQ
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        address_to_dsn(&mut self.prop, ctx.nodes).map_err(unresolved)?;
        self.dsn = str_field(&self.prop, "dsn").unwrap_or_default().to_string();
        Ok(())
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let name = str_field(&self.prop, "name").unwrap_or_default();
        let url = ctx.link.node_url(&self.dsn, &format!("properties/{name}.json"));
        InitOutcome::Send(ctx.link.request(HttpMethod::Get, url))
    }

    fn on_success(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(mut body) = resp.json() else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        if let Some(prop) = body.get_mut("property").and_then(Value::as_object_mut) {
            prop.entry("dsn").or_insert_with(|| json!(self.dsn));
        }
        let props = props_to_app(&json!([body]), ctx.nodes);
        if !props.is_empty() {
            ctx.app.prop_resp(PROTO_GATEWAY, cmd.req_id, Value::Array(props), SOURCE_ADS);
        }
        StepOutcome::Done
    }
}

/// Fetches every property (or only the to-device ones) of a node.
pub struct NodePropsGet {
    address: String,
    dsn: String,
    all: bool,
}

impl NodePropsGet {
    pub fn new(address: impl Into<String>, all: bool) -> Self {
        Self { address: address.into(), dsn: String::new(), all }
    }
}

impl Command for NodePropsGet {
    fn name(&self) -> &'static str {
        if self.all {
            OP_PROP_REQ_ALL
        } else {
            OP_PROP_REQ_TO_DEV
        }
    }

    fn prepare(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        self.dsn = ctx.nodes.dsn_for(&self.address).map_err(unresolved)?.to_string();
        Ok(())
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let filter = if self.all { "all=true" } else { "input=true" };
        let url = ctx.link.node_url(&self.dsn, &format!("commands.json?{filter}"));
        InitOutcome::Send(ctx.link.request(HttpMethod::Get, url))
    }

    fn on_success(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(commands) = resp.json().and_then(|body| body.get("commands").cloned()).filter(Value::is_object)
        else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        let props = commands.get("node_properties").map(|props| props_to_app(props, ctx.nodes)).unwrap_or_default();
        if !props.is_empty() {
            ctx.app.prop_resp(PROTO_GATEWAY, cmd.req_id, Value::Array(props), SOURCE_ADS);
        }
        StepOutcome::Done
    }
}

/// Reports the application's outcome of a node reset or registration
/// command back to the cloud.
pub struct NodeCmdResult {
    op: &'static str,
    info: Value,
}

impl NodeCmdResult {
    pub fn reset(info: Value) -> Self {
        Self { op: OP_NODE_RST_RESULT, info }
    }

    pub fn registration(info: Value) -> Self {
        Self { op: OP_NODE_REG_RESULT, info }
    }

    fn succeeded(&self) -> bool {
        int_field(&self.info, "success").is_some_and(|success| success != 0)
    }
}

impl Command for NodeCmdResult {
    fn name(&self) -> &'static str {
        self.op
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let (Some(_), Some(msg_code), Some(cmd_id), Some(cmd_uri)) = (
            int_field(&self.info, "success"),
            int_field(&self.info, "msg_code"),
            int_field(&self.info, "cmd_id"),
            str_field(&self.info, "cmd_uri"),
        ) else {
            log::warn!("gateway: incomplete {} info", self.op);
            return InitOutcome::Fail(ErrType::Unknown);
        };
        let status = if self.succeeded() { STATUS_OK } else { STATUS_NOT_ACCEPTABLE };
        let url = ctx.link.device_url(&format!("{cmd_uri}?cmd_id={cmd_id}&status={status}&msg_code={msg_code}"));
        InitOutcome::Send(ctx.link.request(HttpMethod::Put, url))
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
        if self.op != OP_NODE_RST_RESULT || !self.succeeded() {
            return StepOutcome::Done;
        }
        let Some(dsn) = str_field(&self.info, "address").and_then(|address| ctx.nodes.dsn(address)) else {
            return StepOutcome::Done;
        };
        log::info!("gateway: node {dsn} reset, forgetting it");
        ctx.events.push(OpEvent::NodeUnmapped { dsn: dsn.to_string() });
        StepOutcome::Done
    }
}

/// Node image details in an `ota` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeOtaImage {
    pub url: String,
    pub checksum: String,
    pub size: u64,
    #[serde(default)]
    pub ver: String,
    #[serde(default)]
    pub source: Option<String>,
}

impl NodeOtaImage {
    fn from_info(info: &Value) -> Option<Self> {
        let ota = info.get("cmd_data")?.get("ota")?;
        serde_json::from_value(ota.clone()).ok()
    }

    fn is_local(&self) -> bool {
        self.source.as_deref().map_or(true, |source| source == "local")
    }
}

fn save_location(info: &Value) -> Option<&str> {
    str_field(info, "save_location")
}

/// Reports whether the application takes a node image, then fetches it
/// when it gave a place to store it.
pub struct NodeOtaResult {
    info: Value,
}

impl NodeOtaResult {
    pub fn new(info: Value) -> Self {
        Self { info }
    }
}

impl Command for NodeOtaResult {
    fn name(&self) -> &'static str {
        OP_NODE_OTA_RESULT
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let (Some(cmd_id), Some(cmd_uri), Some(_)) =
            (int_field(&self.info, "cmd_id"), str_field(&self.info, "cmd_uri"), self.info.get("cmd_data"))
        else {
            log::warn!("gateway: incomplete node_ota_result info");
            return InitOutcome::Fail(ErrType::Unknown);
        };
        let status = if save_location(&self.info).is_some() { STATUS_OK } else { STATUS_NOT_ACCEPTABLE };
        let url = ctx.link.device_url(&format!("{cmd_uri}?cmd_id={cmd_id}&status={status}"));
        InitOutcome::Send(ctx.link.request(HttpMethod::Put, url))
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
        if save_location(&self.info).is_none() {
            log::info!("gateway: node image declined");
            return StepOutcome::Done;
        }
        let Some(image) = NodeOtaImage::from_info(&self.info) else {
            log::warn!("gateway: bad node ota object");
            return StepOutcome::Failed(ErrType::Unknown);
        };
        if image.is_local() {
            StepOutcome::Next(Box::new(NodeOtaFetch::local(self.info.clone())))
        } else {
            StepOutcome::Next(Box::new(NodeOtaUrlFetch::new(self.info.clone())))
        }
    }
}

/// Resolves where a remotely stored node image lives.
pub struct NodeOtaUrlFetch {
    info: Value,
}

impl NodeOtaUrlFetch {
    pub fn new(info: Value) -> Self {
        Self { info }
    }
}

impl Command for NodeOtaUrlFetch {
    fn name(&self) -> &'static str {
        OP_NODE_OTA_URL_FETCH
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let url = self.info.pointer("/cmd_data/ota/url").and_then(Value::as_str).unwrap_or_default();
        if url.is_empty() {
            log::warn!("gateway: missing node OTA info URL");
            return InitOutcome::Fail(ErrType::Unknown);
        }
        InitOutcome::Send(ctx.link.request(HttpMethod::Get, url))
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(body) = resp.json().filter(|body| body.get("ota").is_some()) else {
            log::warn!("gateway: no ota object");
            return StepOutcome::Failed(ErrType::Unknown);
        };
        let mut info = self.info.clone();
        info["cmd_data"] = body;
        StepOutcome::Next(Box::new(NodeOtaFetch::remote(info)))
    }
}

#[derive(Debug, thiserror::Error)]
enum ImageError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected {expected} bytes, received {actual}")]
    Size { expected: u64, actual: u64 },

    #[error("expected md5 {expected}, received {actual}")]
    Checksum { expected: String, actual: String },
}

fn verify_image(path: &Path, image: &NodeOtaImage) -> Result<(), ImageError> {
    let mut file = File::open(path)?;
    let actual = file.metadata()?.len();
    if actual != image.size {
        return Err(ImageError::Size { expected: image.size, actual });
    }
    let mut hasher = Md5::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = format!("{:x}", hasher.finalize());
    if !digest.eq_ignore_ascii_case(&image.checksum) {
        return Err(ImageError::Checksum { expected: image.checksum.clone(), actual: digest });
    }
    Ok(())
}

/// Downloads a node image to the application's save location and checks
/// its size and MD5.
pub struct NodeOtaFetch {
    info: Value,
    remote: bool,
}

impl NodeOtaFetch {
    pub fn local(info: Value) -> Self {
        Self { info, remote: false }
    }

    pub fn remote(info: Value) -> Self {
        Self { info, remote: true }
    }
}

impl Command for NodeOtaFetch {
    fn name(&self) -> &'static str {
        if self.remote {
            OP_NODE_OTA_REMOTE_FETCH
        } else {
            OP_NODE_OTA_LOCAL_FETCH
        }
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let (Some(path), Some(image)) = (save_location(&self.info), NodeOtaImage::from_info(&self.info)) else {
            return InitOutcome::Fail(ErrType::Unknown);
        };
        let request = ctx.link.request(HttpMethod::Get, image.url).save_to(PathBuf::from(path));
        InitOutcome::Send(if self.remote { request.external() } else { request })
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
        let (Some(path), Some(image)) = (save_location(&self.info), NodeOtaImage::from_info(&self.info)) else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        match verify_image(Path::new(path), &image) {
            Ok(()) => {
                log::info!("gateway: node image {} saved to {path}", image.ver);
                StepOutcome::Done
            }
            Err(err) => {
                log::warn!("gateway: bad node image: {err}");
                StepOutcome::Failed(ErrType::Unknown)
            }
        }
    }
}
