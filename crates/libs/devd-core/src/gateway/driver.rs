use super::{
    OP_CONN_STATUS_REQ, OP_NODE_FACTORY_RST, OP_NODE_OTA, OP_NODE_REG, OP_SCHED_UPDATE, PROTO_GATEWAY,
};
use crate::app::{new_cmd, set_args, set_opt, AppOutbox, ReqId, OP_PROP_REQ, OP_PROP_UPDATE};
use crate::dests::Source;
use serde_json::{json, Value};

/// A cloud command addressed to one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCommand {
    pub address: String,
    pub cmd_id: i64,
    /// Resource the result is reported to.
    pub cmd_uri: String,
    pub cmd_data: Value,
}

impl NodeCommand {
    fn to_value(&self) -> Value {
        json!({
            "address": self.address,
            "cmd_id": self.cmd_id,
            "cmd_uri": self.cmd_uri,
            "cmd_data": self.cmd_data,
        })
    }
}

/// The node network behind the gateway.
///
/// Results come back asynchronously as gateway requests (`conn_status_resp`,
/// `prop_resp`, `node_rst_result`, `node_reg_result`, `node_ota_result`).
pub trait NodeDriver {
    /// Asks for the connection state of the nodes at `addresses`. Returns
    /// the id the answer carries.
    fn query_info(&mut self, addresses: &[String]) -> ReqId;

    /// Registration status change for a node.
    fn configure(&mut self, cmd: &NodeCommand);

    /// Property values for nodes, already in node addressing.
    fn prop_set(&mut self, props: Value, source: Source);

    /// Schedules for nodes.
    fn sched_set(&mut self, scheds: Value, source: Source);

    /// Asks for the current value of one node property. Returns the id the
    /// answer carries.
    fn prop_get(&mut self, prop: Value) -> ReqId;

    /// Factory reset: the node leaves the network.
    fn leave(&mut self, cmd: &NodeCommand);

    fn ota_update(&mut self, cmd: &NodeCommand, version: Option<&str>);
}

impl AppOutbox {
    fn gateway_cmd(&mut self, op: &str, args: Value) -> ReqId {
        let id = self.take_id();
        let mut root = new_cmd(PROTO_GATEWAY, op, id);
        set_args(&mut root, args);
        self.push(root);
        id
    }

    fn gateway_update(&mut self, op: &str, args: Value, source: Source) {
        let id = self.take_id();
        let mut root = new_cmd(PROTO_GATEWAY, op, id);
        set_args(&mut root, args);
        if source != 0 {
            set_opt(&mut root, "source", json!(source));
        }
        self.push(root);
    }
}

/// The local application drives the node network over the JSON interface.
impl NodeDriver for AppOutbox {
    fn query_info(&mut self, addresses: &[String]) -> ReqId {
        self.gateway_cmd(OP_CONN_STATUS_REQ, json!([{"addresses": addresses}]))
    }

    fn configure(&mut self, cmd: &NodeCommand) {
        self.gateway_cmd(OP_NODE_REG, json!([cmd.to_value()]));
    }

    fn prop_set(&mut self, props: Value, source: Source) {
        self.gateway_update(OP_PROP_UPDATE, props, source);
    }

    fn sched_set(&mut self, scheds: Value, source: Source) {
        self.gateway_update(OP_SCHED_UPDATE, scheds, source);
    }

    fn prop_get(&mut self, prop: Value) -> ReqId {
        self.gateway_cmd(OP_PROP_REQ, json!([{"property": prop}]))
    }

    fn leave(&mut self, cmd: &NodeCommand) {
        self.gateway_cmd(OP_NODE_FACTORY_RST, json!([cmd.to_value()]));
    }

    fn ota_update(&mut self, cmd: &NodeCommand, version: Option<&str>) {
        let mut info = cmd.to_value();
        if let Some(version) = version {
            info["version"] = json!(version);
        }
        self.gateway_cmd(OP_NODE_OTA, json!([info]));
    }
}
