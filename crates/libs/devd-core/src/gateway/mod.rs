//! Gateway protocol: nodes behind this device.
//!
//! The application manages a network of nodes and talks about them with the
//! `gateway` protocol, in node addresses and split property names. Commands
//! for the cloud and LAN clients are converted to node DSNs and joined names
//! before delivery; updates flow back through a [`NodeDriver`].

mod driver;
mod nodes;
pub mod ops;

pub use driver::{NodeCommand, NodeDriver};
pub use nodes::{
    address_to_dsn, dsn_to_address, is_valid_dsn, join_prop_name, prop_to_app, prop_to_cloud, props_to_app,
    schedules_to_app, split_name, split_prop_name, NodeError, NodeMap, NodeMapping, PROP_NAME_DELIM,
};

use crate::app::{
    AppOutbox, AppRequest, ReqId, OP_PROP_BATCH_SEND, OP_PROP_REQ, OP_PROP_RESP, OP_PROP_SEND,
};
use crate::dests::{DestMask, Source};
use crate::error::ErrType;
use crate::ops::{Command, OpCmd};
use crate::props::{echo_needed, request_dests, QueuedCmd};
use ops::{
    ConnStatus, NodeAdd, NodeBatchSend, NodeCmdResult, NodeOtaResult, NodePropAck, NodePropGet, NodePropSend,
    NodePropsGet, NodeRemove, NodeUpdate,
};
use serde_json::{json, Value};

pub const PROTO_GATEWAY: &str = "gateway";

pub const OP_NODE_ADD: &str = "add_node";
pub const OP_NODE_UPDATE: &str = "update_node";
pub const OP_NODE_REMOVE: &str = "remove_node";
pub const OP_CONN_STATUS: &str = "conn_status";
pub const OP_CONN_STATUS_REQ: &str = "conn_status_req";
pub const OP_CONN_STATUS_RESP: &str = "conn_status_resp";
pub const OP_PROP_ACK: &str = "prop_ack";
pub const OP_PROP_REQ_ALL: &str = "prop_req_all";
pub const OP_PROP_REQ_TO_DEV: &str = "prop_req_to_dev";
pub const OP_SCHED_UPDATE: &str = "sched_update";
pub const OP_NODE_FACTORY_RST: &str = "node_factory_rst";
pub const OP_NODE_RST_RESULT: &str = "node_rst_result";
pub const OP_NODE_OTA: &str = "node_ota";
pub const OP_NODE_OTA_RESULT: &str = "node_ota_result";
pub const OP_NODE_OTA_URL_FETCH: &str = "node_ota_url_fetch";
pub const OP_NODE_OTA_LOCAL_FETCH: &str = "node_ota_local_fetch";
pub const OP_NODE_OTA_REMOTE_FETCH: &str = "node_ota_remote_fetch";
pub const OP_NODE_REG: &str = "node_reg";
pub const OP_NODE_REG_RESULT: &str = "node_reg_result";

/// What the daemon does with one `gateway` protocol request.
pub enum GatewayAction {
    Done,
    Queue(OpCmd, Box<dyn Command>),
    /// Answer to a node property request made for a LAN client.
    PropResp { id: ReqId, args: Option<Value> },
    /// Answer to a connection status request made for a LAN client.
    ConnStatusResp { id: ReqId, args: Option<Value> },
}

fn invalid_args(app: &mut AppOutbox, req: &AppRequest) -> GatewayAction {
    app.nak(PROTO_GATEWAY, ErrType::InvalidArgs, req.id);
    if req.opts.confirm {
        app.confirm_false(PROTO_GATEWAY, req.id, DestMask::ADS, Some(ErrType::InvalidArgs));
    }
    GatewayAction::Done
}

fn node_address(info: &Value) -> Option<String> {
    info.get("node")?.get("address")?.as_str().map(str::to_string)
}

fn address(info: &Value) -> Option<String> {
    info.get("address")?.as_str().map(str::to_string)
}

/// Joins the property name in place and returns the `op_args` that identify
/// the property in node terms.
fn node_prop(first: &Value) -> Option<(Value, String, Value)> {
    let mut prop = first.get("property").filter(|prop| prop.is_object())?.clone();
    let address = address(&prop)?;
    let mut parts = match join_prop_name(&mut prop) {
        Ok(parts) => parts,
        Err(err) => {
            log::warn!("gateway: {err}");
            return None;
        }
    };
    parts["address"] = json!(address);
    Some((prop, address, json!([parts])))
}

const KNOWN_OPS: [&str; 13] = [
    OP_NODE_ADD,
    OP_NODE_UPDATE,
    OP_NODE_REMOVE,
    OP_CONN_STATUS,
    OP_PROP_SEND,
    OP_PROP_BATCH_SEND,
    OP_PROP_REQ,
    OP_PROP_ACK,
    OP_PROP_REQ_ALL,
    OP_PROP_REQ_TO_DEV,
    OP_NODE_RST_RESULT,
    OP_NODE_REG_RESULT,
    OP_NODE_OTA_RESULT,
];

/// Handles one `gateway` protocol request.
pub fn handle_gateway_request(req: &AppRequest, dests_avail: DestMask, app: &mut AppOutbox) -> GatewayAction {
    let Some(op) = req.op.as_deref() else {
        app.nak(PROTO_GATEWAY, ErrType::InvalidOp, req.id);
        return GatewayAction::Done;
    };
    if req.is_reply() {
        return GatewayAction::Done;
    }
    match op {
        OP_PROP_RESP => return GatewayAction::PropResp { id: req.id, args: req.args.clone() },
        OP_CONN_STATUS_RESP => return GatewayAction::ConnStatusResp { id: req.id, args: req.args.clone() },
        _ => {}
    }
    if !KNOWN_OPS.contains(&op) {
        log::warn!("gateway: can't process op {op}");
        app.nak(PROTO_GATEWAY, ErrType::InvalidOp, req.id);
        return GatewayAction::Done;
    }
    let Some(args) = req.args.as_ref().and_then(Value::as_array) else {
        return invalid_args(app, req);
    };
    let Some(first) = args.first() else {
        return GatewayAction::Done;
    };

    let mut cmd = OpCmd { proto: PROTO_GATEWAY, ..OpCmd::new(req.id, DestMask::ADS) };
    cmd.confirm = req.opts.confirm;
    cmd.echo = req.opts.echo;
    cmd.source = req.opts.source;
    let mut ack = true;
    let handler: Box<dyn Command> = match op {
        OP_NODE_ADD | OP_NODE_UPDATE | OP_NODE_REMOVE => {
            let Some(address) = node_address(first) else {
                return invalid_args(app, req);
            };
            cmd.echo = false;
            cmd.err_name = Some(address.clone());
            match op {
                OP_NODE_ADD => Box::new(NodeAdd::new(first.clone())),
                OP_NODE_UPDATE => Box::new(NodeUpdate::new(first.clone(), address)),
                _ => Box::new(NodeRemove::new(address)),
            }
        }
        OP_CONN_STATUS => {
            cmd.err_name = address(first);
            cmd.dests_target = if dests_avail.is_empty() { DestMask::ADS } else { dests_avail };
            Box::new(ConnStatus::new(Value::Array(args.clone())))
        }
        OP_PROP_SEND | OP_PROP_REQ | OP_PROP_ACK => {
            let Some((prop, address, op_args)) = node_prop(first) else {
                return invalid_args(app, req);
            };
            cmd.err_name = Some(address);
            cmd.op_args = Some(op_args);
            match op {
                OP_PROP_SEND => {
                    (cmd.dests_target, cmd.dests_specified) = request_dests(&req.opts, dests_avail);
                    Box::new(NodePropSend::new(prop))
                }
                OP_PROP_REQ => Box::new(NodePropGet::new(prop)),
                _ => {
                    if req.opts.source == 0 {
                        return invalid_args(app, req);
                    }
                    cmd.dests_target = dests_avail | DestMask::from_source(req.opts.source);
                    Box::new(NodePropAck::new(prop))
                }
            }
        }
        OP_PROP_BATCH_SEND => {
            cmd.err_name = Some(OP_PROP_BATCH_SEND.to_string());
            (cmd.dests_target, cmd.dests_specified) = request_dests(&req.opts, dests_avail);
            Box::new(NodeBatchSend::new(Value::Array(args.clone())))
        }
        OP_PROP_REQ_ALL | OP_PROP_REQ_TO_DEV => {
            let Some(address) = address(first) else {
                return invalid_args(app, req);
            };
            ack = false;
            cmd.err_name = Some(address.clone());
            Box::new(NodePropsGet::new(address, op == OP_PROP_REQ_ALL))
        }
        _ => {
            cmd.echo = false;
            cmd.err_name = address(first);
            match op {
                OP_NODE_RST_RESULT => Box::new(NodeCmdResult::reset(first.clone())),
                OP_NODE_REG_RESULT => Box::new(NodeCmdResult::registration(first.clone())),
                _ => Box::new(NodeOtaResult::new(first.clone())),
            }
        }
    };
    if ack {
        app.ack(PROTO_GATEWAY, req.id);
    }
    GatewayAction::Queue(cmd, handler)
}

/// Echo of a node property (application form) to every available
/// destination except its source.
pub fn prepare_node_echo(prop: &Value, source: Source, dests_avail: DestMask) -> Option<QueuedCmd> {
    let echo_dest = dests_avail & !DestMask::from_source(source);
    if echo_dest.is_empty() {
        return None;
    }
    let (prop, address, op_args) = node_prop(&json!({"property": prop}))?;
    log::debug!("gateway: echoing {} of {address} to {echo_dest}", prop["name"]);
    let mut cmd = OpCmd { proto: PROTO_GATEWAY, ..OpCmd::new(0, echo_dest) };
    cmd.echo = true;
    cmd.err_name = Some(address);
    cmd.op_args = Some(op_args);
    Some((cmd, Box::new(NodePropSend::new(prop))))
}

/// Hands node property updates from the cloud or a LAN client to the driver
/// and returns the echoes to queue.
pub fn deliver_node_updates(
    props: &Value,
    source: Source,
    dests_avail: DestMask,
    auto_sync: bool,
    nodes: &NodeMap,
    driver: &mut dyn NodeDriver,
) -> Vec<QueuedCmd> {
    let items = props_to_app(props, nodes);
    if items.is_empty() {
        return Vec::new();
    }
    let echoes = items
        .iter()
        .filter_map(|item| item.get("property"))
        .filter(|prop| echo_needed(prop, source, dests_avail, auto_sync))
        .filter_map(|prop| prepare_node_echo(prop, source, dests_avail))
        .collect();
    driver.prop_set(Value::Array(items), source);
    echoes
}

pub fn deliver_node_schedules(scheds: &Value, source: Source, nodes: &NodeMap, driver: &mut dyn NodeDriver) {
    let items = schedules_to_app(scheds, nodes);
    if !items.is_empty() {
        driver.sched_set(Value::Array(items), source);
    }
}
