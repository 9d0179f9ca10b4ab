use crate::endpoint::Endpoint;
use crate::error::AmsgError;
use crate::responder::Responder;
use crate::wire::Message;
use std::collections::HashMap;
use std::rc::Rc;

/// Interface id reserved for the transport's own control traffic.
pub const INTERNAL_INTERFACE: u8 = 0;

pub const MSG_DEFAULT_RESP: u8 = 0;
pub const MSG_PING: u8 = 1;
pub const MSG_PING_RESP: u8 = 2;

/// Handles every request and unmatched response addressed to one interface id.
pub trait InterfaceHandler {
    fn handle(
        &self,
        endpoint: &Endpoint,
        msg: &Message,
        responder: &mut Responder,
    ) -> Result<(), AmsgError>;
}

impl<F> InterfaceHandler for F
where
    F: Fn(&Endpoint, &Message, &mut Responder) -> Result<(), AmsgError>,
{
    fn handle(
        &self,
        endpoint: &Endpoint,
        msg: &Message,
        responder: &mut Responder,
    ) -> Result<(), AmsgError> {
        self(endpoint, msg, responder)
    }
}

/// Handler table shared by every endpoint created from it.
///
/// Filled in at startup and read-only afterwards; endpoints hold it behind an
/// `Rc`, so registration after the first endpoint exists is not possible.
#[derive(Default)]
pub struct Interfaces {
    handlers: HashMap<u8, Rc<dyn InterfaceHandler>>,
}

impl Interfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, interface: u8, handler: H) -> Result<(), AmsgError>
    where
        H: InterfaceHandler + 'static,
    {
        if interface == INTERNAL_INTERFACE {
            return Err(AmsgError::InterfaceUnsupported);
        }
        if self.handlers.contains_key(&interface) {
            return Err(AmsgError::AlreadyExists);
        }
        self.handlers.insert(interface, Rc::new(handler));
        Ok(())
    }

    pub fn get(&self, interface: u8) -> Option<Rc<dyn InterfaceHandler>> {
        self.handlers.get(&interface).cloned()
    }

    pub fn into_shared(self) -> Rc<Interfaces> {
        Rc::new(self)
    }
}

/// Payload of a `DEFAULT_RESP` message: which request it answers and the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultResponse {
    pub interface: u8,
    pub msg_type: u8,
    pub error: Option<AmsgError>,
}

impl DefaultResponse {
    pub const LEN: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let code = self.error.map(AmsgError::code).unwrap_or(0).to_be_bytes();
        [self.interface, self.msg_type, code[0], code[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AmsgError> {
        if bytes.len() < Self::LEN {
            return Err(AmsgError::MsgTruncated);
        }
        Ok(DefaultResponse {
            interface: bytes[0],
            msg_type: bytes[1],
            error: AmsgError::from_code(u16::from_be_bytes([bytes[2], bytes[3]])),
        })
    }

    /// Extracts the carried error if `msg` is a default response.
    pub(crate) fn error_in(msg: &Message) -> Option<AmsgError> {
        if msg.interface != INTERNAL_INTERFACE || msg.msg_type != MSG_DEFAULT_RESP {
            return None;
        }
        match DefaultResponse::from_bytes(&msg.payload) {
            Ok(resp) => resp.error,
            Err(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultResponse, Interfaces, INTERNAL_INTERFACE};
    use crate::endpoint::Endpoint;
    use crate::error::AmsgError;
    use crate::responder::Responder;
    use crate::wire::Message;

    fn noop(_: &Endpoint, _: &Message, _: &mut Responder) -> Result<(), AmsgError> {
        Ok(())
    }

    #[test]
    fn internal_interface_cannot_be_registered() {
        let mut interfaces = Interfaces::new();
        assert_eq!(
            interfaces.register(INTERNAL_INTERFACE, noop),
            Err(AmsgError::InterfaceUnsupported)
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut interfaces = Interfaces::new();
        interfaces.register(3, noop).expect("first registration");
        assert_eq!(interfaces.register(3, noop), Err(AmsgError::AlreadyExists));
        assert!(interfaces.get(3).is_some());
        assert!(interfaces.get(4).is_none());
    }

    #[test]
    fn default_response_carries_error_code() {
        let resp = DefaultResponse {
            interface: 5,
            msg_type: 2,
            error: Some(AmsgError::TypeUnsupported),
        };
        let bytes = resp.to_bytes();
        assert_eq!(bytes, [5, 2, 0, 5]);
        assert_eq!(DefaultResponse::from_bytes(&bytes).expect("decode"), resp);
        assert_eq!(DefaultResponse::from_bytes(&[5, 2]), Err(AmsgError::MsgTruncated));
    }
}
