use crate::error::AmsgError;
use std::fmt;

pub const MAGIC: [u8; 2] = [0x5f, 0xa0];
pub const PROTOCOL_VERSION: u8 = 0x10;
pub const HEADER_LEN: usize = 12;

/// Upper bound on header plus payload. Checked against the peeked header
/// before any payload buffer is allocated.
pub const MAX_MSG_SIZE: usize = 8_000_000;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const RESPONSE_REQUESTED: Flags = Flags(0x01);
    pub const RESPONSE: Flags = Flags(0x02);
    pub const SYNC: Flags = Flags(0x04);

    const KNOWN: u8 = 0x07;

    pub fn from_bits(bits: u8) -> Self {
        Flags(bits & Self::KNOWN)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Flags::RESPONSE_REQUESTED) {
            parts.push("RESP_REQ");
        }
        if self.contains(Flags::RESPONSE) {
            parts.push("RESP");
        }
        if self.contains(Flags::SYNC) {
            parts.push("SYNC");
        }
        write!(f, "Flags({})", parts.join("|"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub flags: Flags,
    pub interface: u8,
    pub msg_type: u8,
    pub seq: u16,
    pub payload_len: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = PROTOCOL_VERSION;
        out[3] = self.flags.bits();
        out[4] = self.interface;
        out[5] = self.msg_type;
        out[6..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AmsgError> {
        if bytes.len() < HEADER_LEN {
            return Err(AmsgError::MsgTruncated);
        }
        if bytes[0..2] != MAGIC {
            return Err(AmsgError::MagicBad);
        }
        if bytes[2] != PROTOCOL_VERSION {
            return Err(AmsgError::VersionUnsupported);
        }
        let header = Header {
            flags: Flags::from_bits(bytes[3]),
            interface: bytes[4],
            msg_type: bytes[5],
            seq: u16::from_be_bytes([bytes[6], bytes[7]]),
            payload_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        };
        if header.total_len() > MAX_MSG_SIZE {
            return Err(AmsgError::MessageTooLarge);
        }
        Ok(header)
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// A decoded message as seen by handlers and reply callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub interface: u8,
    pub msg_type: u8,
    pub flags: Flags,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub(crate) fn from_parts(header: Header, payload: Vec<u8>) -> Self {
        Message {
            interface: header.interface,
            msg_type: header.msg_type,
            flags: header.flags,
            seq: header.seq,
            payload,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(Flags::RESPONSE)
    }

    pub fn response_requested(&self) -> bool {
        self.flags.contains(Flags::RESPONSE_REQUESTED)
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(Flags::SYNC)
    }
}
