use super::{Command, InitOutcome, LanPayload, OpCmd, OpContext, StepOutcome};
use crate::app::{error_object, OP_ECHO_FAILURE, OP_PROP_BATCH_SEND, OP_PROP_REQ, OP_PROP_SEND, PROTO_DATA};
use crate::dests::{DestMask, SOURCE_ADS};
use crate::error::ErrType;
use crate::http::{HttpMethod, HttpResponse, STATUS_NOT_FOUND, STATUS_OK};
use serde_json::{json, Value};

/// LAN client resource receiving property datapoints.
pub const LAN_PROP_SEND_URL: &str = "property/datapoint.json";

/// Sends one property datapoint to LAN clients and the cloud.
///
/// Also used for echoes of updates that arrived from another destination.
pub struct PropSend {
    op: &'static str,
    name: String,
    prop_info: Value,
}

impl PropSend {
    pub fn new(name: impl Into<String>, prop_info: Value) -> Self {
        Self { op: OP_PROP_SEND, name: name.into(), prop_info }
    }

    pub fn echo(name: impl Into<String>, prop_info: Value) -> Self {
        Self { op: OP_ECHO_FAILURE, name: name.into(), prop_info }
    }
}

impl Command for PropSend {
    fn name(&self) -> &'static str {
        self.op
    }

    fn lan_payloads(&self, cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        let resource = format!("{LAN_PROP_SEND_URL}{}", cmd.echo_suffix());
        Some(vec![LanPayload::new(resource, self.prop_info.clone())])
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        if !cmd.dests_target.has_ads() {
            return InitOutcome::Done;
        }
        let url = ctx
            .link
            .device_url(&format!("properties/{}/datapoints.json{}", self.name, cmd.echo_suffix()));
        InitOutcome::Send(
            ctx.link
                .request(HttpMethod::Post, url)
                .json(json!({"datapoint": self.prop_info})),
        )
    }
}

/// Sends several datapoints in one request. The cloud answers with a status
/// per datapoint; each failed one is NAKed on its own.
pub struct BatchSend {
    batch: Value,
    cloud_rest: &'static str,
    lan_resource: &'static str,
}

impl BatchSend {
    pub fn new(batch: Value) -> Self {
        Self::routed(batch, "batch_datapoints.json", LAN_PROP_SEND_URL)
    }

    /// Batch posted to `dev/v1/dsns/<dsn>/<cloud_rest>`, entries to `lan_resource`.
    pub fn routed(batch: Value, cloud_rest: &'static str, lan_resource: &'static str) -> Self {
        Self { batch, cloud_rest, lan_resource }
    }

    pub fn batch_mut(&mut self) -> &mut Value {
        &mut self.batch
    }
}

impl Command for BatchSend {
    fn name(&self) -> &'static str {
        OP_PROP_BATCH_SEND
    }

    fn lan_payloads(&self, cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        let props = self.batch.as_array()?;
        let resource = format!("{}{}", self.lan_resource, cmd.echo_suffix());
        Some(
            props
                .iter()
                .filter_map(|entry| entry.get("property"))
                .map(|prop| LanPayload::new(resource.clone(), prop.clone()))
                .collect(),
        )
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        if !cmd.dests_target.has_ads() {
            return InitOutcome::Done;
        }
        let url = ctx.link.dsn_url(self.cloud_rest);
        InitOutcome::Send(
            ctx.link
                .request(HttpMethod::Post, url)
                .json(json!({"batch_datapoints": self.batch})),
        )
    }

    fn on_success(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(results) = resp.json().and_then(|body| body.get("batch_datapoints").cloned()) else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        let Some(results) = results.as_array() else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        for result in results {
            let (Some(_), Some(status)) = (
                result.get("batch_id").and_then(Value::as_i64),
                result.get("status").and_then(Value::as_i64),
            ) else {
                return StepOutcome::Failed(ErrType::Unknown);
            };
            if status == i64::from(STATUS_OK) {
                continue;
            }
            let err = if status == i64::from(STATUS_NOT_FOUND) {
                ErrType::UnknownProp
            } else {
                ErrType::ConnErr
            };
            cmd.err_type = Some(err);
            if cmd.local {
                continue;
            }
            let args = json!([error_object(
                cmd.err_name.as_deref(),
                DestMask::ADS,
                Some(err),
                Some(self.name()),
                Some(result),
            )]);
            ctx.app.nak_with_args(cmd.proto, args, cmd.req_id);
        }
        StepOutcome::Done
    }
}

/// Fetches the cloud value of one property for the application.
pub struct PropGet {
    name: String,
}

impl PropGet {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Command for PropGet {
    fn name(&self) -> &'static str {
        OP_PROP_REQ
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let url = ctx.link.device_url(&format!("properties/{}.json", self.name));
        InitOutcome::Send(ctx.link.request(HttpMethod::Get, url))
    }

    fn on_success(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(body) = resp.json() else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        ctx.app.prop_resp(PROTO_DATA, cmd.req_id, json!([body]), SOURCE_ADS);
        StepOutcome::Done
    }
}
