use crate::endpoint::{Endpoint, ReplyTo};
use crate::error::AmsgError;
use crate::wire::Message;
use std::rc::Weak;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Open,
    Sent,
    Deferred,
}

/// Answers the request currently being handled.
///
/// If the peer asked for a response and the handler neither sends one nor
/// defers it, a default response is sent once the handler returns. A handler
/// error is reported the same way.
pub struct Responder {
    endpoint: Endpoint,
    target: Option<ReplyTo>,
    state: State,
}

impl Responder {
    pub(crate) fn for_message(
        endpoint: &Endpoint,
        msg: &Message,
        reply_fd: Option<std::os::fd::OwnedFd>,
    ) -> Self {
        let target = (msg.response_requested() && !msg.is_response()).then(|| ReplyTo {
            interface: msg.interface,
            msg_type: msg.msg_type,
            seq: msg.seq,
            reply_fd,
        });
        Responder { endpoint: endpoint.clone(), target, state: State::Open }
    }

    pub fn response_requested(&self) -> bool {
        self.target.is_some()
    }

    pub fn send_response(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), AmsgError> {
        if self.state != State::Open {
            return Err(AmsgError::AlreadyExists);
        }
        let target = self.target.take().ok_or(AmsgError::Application)?;
        self.state = State::Sent;
        self.endpoint.reply(target, msg_type, payload)
    }

    /// Takes over the obligation to answer. The returned context may be
    /// completed after the handler returns; dropping it sends nothing.
    pub fn defer(&mut self) -> Option<AsyncResponse> {
        if self.state != State::Open {
            return None;
        }
        let target = self.target.take()?;
        self.state = State::Deferred;
        Some(self.endpoint.owe(target))
    }

    pub(crate) fn finish(mut self, result: Result<(), AmsgError>) {
        if self.state != State::Open {
            return;
        }
        if let Some(target) = self.target.take() {
            if let Err(err) = self.endpoint.reply_default(target, result.err()) {
                log::debug!("amsg: default response failed: {err}");
            }
        }
    }
}

/// A response owed to a peer, detached from the handler that received the request.
pub struct AsyncResponse {
    pub(crate) endpoint: Weak<crate::endpoint::Inner>,
    pub(crate) id: u64,
}

impl AsyncResponse {
    pub fn send(self, msg_type: u8, payload: &[u8]) -> Result<(), AmsgError> {
        let (endpoint, target) = self.claim()?;
        endpoint.reply(target, msg_type, payload)
    }

    /// Answers with a default response carrying `error` (`None` for success).
    pub fn send_default(self, error: Option<AmsgError>) -> Result<(), AmsgError> {
        let (endpoint, target) = self.claim()?;
        endpoint.reply_default(target, error)
    }

    /// Gives up on the response without sending anything.
    pub fn release(self) {}

    fn claim(&self) -> Result<(Endpoint, ReplyTo), AmsgError> {
        let endpoint = Endpoint::upgrade(&self.endpoint).ok_or(AmsgError::Disconnected)?;
        let target = endpoint.take_owed(self.id).ok_or(AmsgError::Disconnected)?;
        Ok((endpoint, target))
    }
}

impl Drop for AsyncResponse {
    fn drop(&mut self) {
        if let Some(endpoint) = Endpoint::upgrade(&self.endpoint) {
            endpoint.take_owed(self.id);
        }
    }
}
