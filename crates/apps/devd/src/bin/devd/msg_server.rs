use amsg::{AmsgError, Endpoint, Interfaces, Message, Responder, Server, SessionCallback, SessionEvent};
use devd_core::app::{
    CLIENT_DESTS, CLIENT_DESTS_REG, CLIENT_DESTS_REQ, CLIENT_LISTEN_ENABLE, DATA_JSON, IFACE_CLIENT, IFACE_DATA,
};
use devd_core::DestMask;
use devd_daemon::Daemon;
use serde_json::{json, Value};
use std::rc::Rc;

/// Session user-data slot marking a session subscribed to destination updates.
const DESTS_SUBSCRIBED: u32 = 1;

/// Handlers for the application-facing interfaces.
pub(super) fn interfaces(daemon: Rc<Daemon>) -> Result<Rc<Interfaces>, AmsgError> {
    let mut interfaces = Interfaces::new();
    let client = daemon.clone();
    interfaces.register(IFACE_CLIENT, move |endpoint: &Endpoint, msg: &Message, responder: &mut Responder| {
        handle_client(&client, endpoint, msg, responder)
    })?;
    interfaces.register(IFACE_DATA, move |_: &Endpoint, msg: &Message, _: &mut Responder| {
        if msg.msg_type != DATA_JSON {
            return Err(AmsgError::TypeUnsupported);
        }
        daemon.update(|ctx, now| ctx.data_message(&msg.payload, now));
        Ok(())
    })?;
    Ok(interfaces.into_shared())
}

fn handle_client(
    daemon: &Daemon,
    endpoint: &Endpoint,
    msg: &Message,
    responder: &mut Responder,
) -> Result<(), AmsgError> {
    match msg.msg_type {
        CLIENT_LISTEN_ENABLE | CLIENT_DESTS_REQ => {}
        CLIENT_DESTS_REG => endpoint.set_user_data(DESTS_SUBSCRIBED, true),
        _ => return Err(AmsgError::TypeUnsupported),
    }
    let Some(reply) = daemon.update(|ctx, now| ctx.client_message(msg.msg_type, now)) else {
        return Ok(());
    };
    let payload = reply.to_string();
    if responder.response_requested() {
        responder.send_response(CLIENT_DESTS, payload.as_bytes())
    } else {
        endpoint.send(IFACE_CLIENT, CLIENT_DESTS, payload.as_bytes())
    }
}

/// JSON interface message for every connected application session.
pub(super) fn broadcast_app(server: &Server, message: &Value) {
    let delivered = server.broadcast(IFACE_DATA, DATA_JSON, message.to_string().as_bytes());
    if delivered == 0 {
        log::debug!("devd: no application session for {}", message["cmd"]["op"]);
    }
}

pub(super) fn broadcast_dests(server: &Server, dests: DestMask) {
    let payload = json!({"dests": dests.bits()}).to_string();
    server.for_each_session(|session| {
        let subscribed = session.with_user_data(DESTS_SUBSCRIBED, |subscribed: &mut bool| *subscribed);
        if subscribed != Some(true) {
            return;
        }
        if let Err(err) = session.send(IFACE_CLIENT, CLIENT_DESTS, payload.as_bytes()) {
            log::debug!("devd: dests update to session {} failed: {err}", session.id());
        }
    });
}

pub(super) fn session_events() -> SessionCallback {
    Rc::new(|endpoint: &Endpoint, event: SessionEvent| {
        log::info!("devd: application session {} {:?}", endpoint.id(), event);
    })
}
