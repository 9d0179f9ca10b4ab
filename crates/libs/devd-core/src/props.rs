//! Property traffic between local applications and the other destinations.
//!
//! Turns `data` protocol requests into queued commands and fans property
//! updates arriving from the cloud or LAN clients out to the application and,
//! as echoes, to every other available destination.

use crate::app::{
    AppOutbox, AppRequest, ReqId, RequestOpts, OP_FILE_DP_CREATE, OP_FILE_DP_FETCHED, OP_FILE_DP_REQ,
    OP_FILE_DP_SEND, OP_PROP_BATCH_SEND, OP_PROP_REQ, OP_PROP_RESP, OP_PROP_SEND, PROTO_DATA,
};
use crate::dests::{DestMask, Source};
use crate::error::ErrType;
use crate::ops::file::{FileDpCreate, FileDpFetched, FileDpRequest, FileDpSend};
use crate::ops::prop::{BatchSend, PropGet, PropSend};
use crate::ops::{Command, OpCmd};
use serde_json::Value;

pub type QueuedCmd = (OpCmd, Box<dyn Command>);

/// What the daemon does with one `data` protocol request.
pub enum DataAction {
    /// Already answered (or ignored).
    Done,
    Queue(OpCmd, Box<dyn Command>),
    /// The application answered a property request made on behalf of a LAN or cloud peer.
    PropResp { id: ReqId, args: Option<Value> },
}

/// Destinations an application request goes to.
///
/// A request naming only LAN clients is limited to the ones currently
/// reachable. No `dests` (or zero) means every available destination plus
/// the cloud. Returns the mask and whether the application picked it.
pub fn request_dests(opts: &RequestOpts, dests_avail: DestMask) -> (DestMask, bool) {
    match opts.dests {
        Some(given) if given != 0 => {
            let given = DestMask::from_bits((given & 0xff) as u8);
            if (given & !DestMask::LAN_APPS).is_empty() {
                (given & dests_avail, true)
            } else {
                (given, true)
            }
        }
        _ => (dests_avail | DestMask::ADS, false),
    }
}

/// Extracts the property object a request operates on. Batch sends take the
/// whole `args` array.
fn prop_info(op: &str, args: Option<&Value>) -> Option<(Value, Option<String>)> {
    let args = args?.as_array()?;
    if op == OP_PROP_BATCH_SEND {
        return Some((Value::Array(args.clone()), Some(OP_PROP_BATCH_SEND.to_string())));
    }
    let prop = args.first()?.as_object()?.get("property")?;
    let name = prop.get("name")?.as_str()?.to_string();
    if op == OP_PROP_SEND {
        let base_type = prop.get("base_type")?.as_str()?;
        if base_type == "boolean" && !is_bool_value(prop.get("value")?) {
            return None;
        }
    }
    Some((prop.clone(), Some(name)))
}

fn is_bool_value(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::Number(number) => matches!(number.as_i64(), Some(0 | 1)),
        _ => false,
    }
}

fn str_field<'a>(prop: &'a Value, key: &str) -> Option<&'a str> {
    prop.get(key).and_then(Value::as_str)
}

fn invalid_args(app: &mut AppOutbox, req: &AppRequest) -> DataAction {
    app.nak(PROTO_DATA, ErrType::InvalidArgs, req.id);
    if req.opts.confirm {
        app.confirm_false(PROTO_DATA, req.id, DestMask::ADS, Some(ErrType::InvalidArgs));
    }
    DataAction::Done
}

/// Handles one `data` protocol request with a known op.
pub fn handle_data_request(req: &AppRequest, dests_avail: DestMask, app: &mut AppOutbox) -> DataAction {
    let Some(op) = req.op.as_deref() else {
        app.nak(PROTO_DATA, ErrType::InvalidOp, req.id);
        return DataAction::Done;
    };
    if req.is_reply() {
        return DataAction::Done;
    }
    if op == OP_PROP_RESP {
        return DataAction::PropResp { id: req.id, args: req.args.clone() };
    }
    let known = [
        OP_PROP_SEND,
        OP_PROP_BATCH_SEND,
        OP_PROP_REQ,
        OP_FILE_DP_SEND,
        OP_FILE_DP_CREATE,
        OP_FILE_DP_REQ,
        OP_FILE_DP_FETCHED,
    ];
    if !known.contains(&op) {
        log::warn!("app: can't process op {op}");
        app.nak(PROTO_DATA, ErrType::InvalidOp, req.id);
        return DataAction::Done;
    }
    let Some((prop, name)) = prop_info(op, req.args.as_ref()) else {
        return invalid_args(app, req);
    };

    let mut dests = DestMask::ADS;
    let mut dests_specified = false;
    let handler: Box<dyn Command> = match op {
        OP_PROP_SEND | OP_PROP_BATCH_SEND => {
            (dests, dests_specified) = request_dests(&req.opts, dests_avail);
            if op == OP_PROP_SEND {
                Box::new(PropSend::new(name.clone().unwrap_or_default(), prop))
            } else {
                Box::new(BatchSend::new(prop))
            }
        }
        OP_PROP_REQ => Box::new(PropGet::new(name.clone().unwrap_or_default())),
        OP_FILE_DP_SEND => {
            let (Some(location), Some(value)) = (str_field(&prop, "location"), str_field(&prop, "value"))
            else {
                return invalid_args(app, req);
            };
            Box::new(FileDpSend::new(location, value))
        }
        OP_FILE_DP_REQ => {
            let (Some(location), Some(value)) = (str_field(&prop, "location"), str_field(&prop, "value"))
            else {
                return invalid_args(app, req);
            };
            Box::new(FileDpRequest::new(location, value))
        }
        OP_FILE_DP_FETCHED => {
            if str_field(&prop, "value").is_none() {
                return invalid_args(app, req);
            }
            Box::new(FileDpFetched::new(str_field(&prop, "location").unwrap_or_default()))
        }
        _ => Box::new(FileDpCreate::new(name.clone().unwrap_or_default(), prop)),
    };
    if op != OP_PROP_REQ {
        app.ack(PROTO_DATA, req.id);
    }

    let mut cmd = OpCmd::new(req.id, dests);
    cmd.confirm = req.opts.confirm;
    cmd.echo = req.opts.echo;
    cmd.source = req.opts.source;
    cmd.dests_specified = dests_specified;
    cmd.err_name = name;
    DataAction::Queue(cmd, handler)
}

/// Whether an update from `source` has to be echoed to other destinations.
/// Properties carrying an `id` need an explicit ack and are echoed later.
pub fn echo_needed(prop: &Value, source: Source, dests_avail: DestMask, auto_sync: bool) -> bool {
    let echo_dest = dests_avail & !DestMask::from_source(source);
    auto_sync && !echo_dest.is_empty() && str_field(prop, "id").is_none()
}

/// Echo of `prop` to every available destination except its source.
pub fn prepare_echo(prop: &Value, source: Source, dests_avail: DestMask) -> Option<QueuedCmd> {
    let echo_dest = dests_avail & !DestMask::from_source(source);
    if echo_dest.is_empty() {
        return None;
    }
    let name = str_field(prop, "name").map(str::to_string);
    let mut cmd = OpCmd::new(0, echo_dest);
    cmd.echo = true;
    cmd.err_name = name.clone();
    log::debug!("props: echoing {} to {}", name.as_deref().unwrap_or("?"), echo_dest);
    Some((cmd, Box::new(PropSend::echo(name.unwrap_or_default(), prop.clone()))))
}

/// Hands an array of `{"property": ...}` updates to the application and
/// returns the echoes to queue.
pub fn deliver_updates(
    props: &Value,
    source: Source,
    dests_avail: DestMask,
    auto_sync: bool,
    app: &mut AppOutbox,
) -> Vec<QueuedCmd> {
    let Some(items) = props.as_array().filter(|items| !items.is_empty()) else {
        return Vec::new();
    };
    app.prop_update(props.clone(), source);
    items
        .iter()
        .filter_map(|item| item.get("property").filter(|prop| prop.is_object()))
        .filter(|prop| echo_needed(prop, source, dests_avail, auto_sync))
        .filter_map(|prop| prepare_echo(prop, source, dests_avail))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dests::SOURCE_ADS;
    use serde_json::json;

    fn request(body: Value) -> AppRequest {
        AppRequest::parse(body.to_string().as_bytes()).expect("request")
    }

    #[test]
    fn dests_default_to_everything_available() {
        let avail = DestMask::ADS | DestMask::lan(1);
        assert_eq!(request_dests(&RequestOpts::default(), avail), (avail, false));
        let lan_only = RequestOpts { dests: Some(0x06), ..RequestOpts::default() };
        assert_eq!(request_dests(&lan_only, avail), (DestMask::lan(1), true));
        let cloud = RequestOpts { dests: Some(1), ..RequestOpts::default() };
        assert_eq!(request_dests(&cloud, DestMask::NONE), (DestMask::ADS, true));
    }

    #[test]
    fn prop_send_is_acked_and_queued() {
        let mut app = AppOutbox::new();
        let req = request(json!({"cmd": {"proto": "data", "id": 12, "op": "prop_send",
            "args": [{"property": {"name": "Blue_LED", "base_type": "boolean", "value": 1}}],
            "opts": {"confirm": true}}}));
        let DataAction::Queue(cmd, handler) = handle_data_request(&req, DestMask::ADS, &mut app) else {
            panic!("expected command");
        };
        assert_eq!(handler.name(), "prop_send");
        assert_eq!(cmd.req_id, 12);
        assert!(cmd.confirm);
        assert_eq!(cmd.err_name.as_deref(), Some("Blue_LED"));
        assert_eq!(app.drain(), vec![json!({"cmd": {"proto": "data", "id": 12, "op": "ack"}})]);
    }

    #[test]
    fn bad_boolean_is_rejected_with_confirm_false() {
        let mut app = AppOutbox::new();
        let req = request(json!({"cmd": {"proto": "data", "id": 3, "op": "prop_send",
            "args": [{"property": {"name": "x", "base_type": "boolean", "value": "on"}}],
            "opts": {"confirm": true}}}));
        assert!(matches!(handle_data_request(&req, DestMask::ADS, &mut app), DataAction::Done));
        let sent = app.drain();
        assert_eq!(sent[0]["cmd"]["op"], json!("nak"));
        assert_eq!(sent[0]["cmd"]["args"], json!([{"err": "invalid_args"}]));
        assert_eq!(sent[1]["cmd"]["op"], json!("confirm_false"));
    }

    #[test]
    fn file_send_needs_location_and_value() {
        let mut app = AppOutbox::new();
        let req = request(json!({"cmd": {"proto": "data", "id": 8, "op": "file_dp_send",
            "args": [{"property": {"name": "log", "location": "/1/2"}}]}}));
        assert!(matches!(handle_data_request(&req, DestMask::ADS, &mut app), DataAction::Done));
        assert_eq!(app.drain()[0]["cmd"]["op"], json!("nak"));
    }

    #[test]
    fn replies_and_unknown_ops() {
        let mut app = AppOutbox::new();
        let ack = request(json!({"cmd": {"proto": "data", "id": 1, "op": "ack"}}));
        assert!(matches!(handle_data_request(&ack, DestMask::ADS, &mut app), DataAction::Done));
        assert!(app.is_empty());
        let missing = request(json!({"cmd": {"proto": "data", "id": 2}}));
        handle_data_request(&missing, DestMask::ADS, &mut app);
        assert_eq!(app.drain()[0]["cmd"]["args"], json!([{"err": "invalid_op"}]));
        let resp = request(json!({"cmd": {"proto": "data", "id": 5, "op": "prop_resp", "args": []}}));
        assert!(matches!(
            handle_data_request(&resp, DestMask::ADS, &mut app),
            DataAction::PropResp { id: 5, .. }
        ));
    }

    #[test]
    fn cloud_updates_reach_app_and_echo_to_lan() {
        let mut app = AppOutbox::new();
        let avail = DestMask::ADS | DestMask::lan(2);
        let props = json!([
            {"property": {"name": "a", "value": 1}},
            {"property": {"name": "b", "value": 2, "id": "ack-me"}}
        ]);
        let echoes = deliver_updates(&props, SOURCE_ADS, avail, true, &mut app);
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].0.dests_target, DestMask::lan(2));
        assert!(echoes[0].0.echo);
        assert_eq!(echoes[0].1.name(), "echo_failure");
        let sent = app.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["cmd"]["op"], json!("prop_update"));
        assert_eq!(sent[0]["cmd"]["args"], props);

        assert!(deliver_updates(&props, SOURCE_ADS, avail, false, &mut app).is_empty());
        assert!(prepare_echo(&json!({"name": "a"}), SOURCE_ADS, DestMask::ADS).is_none());
    }
}
