//! Wire format of the notify protocol.
//!
//! Keyed packets are `encaps | head | body | pad | crc8`, where everything
//! after the encapsulation is AES-128-CBC encrypted with the IV carried in
//! the encapsulation. Registration packets use the DSN encapsulation and are
//! signed instead of encrypted, since the server does not know the client yet.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use crc::{Crc, CRC_8_SMBUS};
use sha2::{Digest, Sha256};

type NpCbcEnc = cbc::Encryptor<aes::Aes128>;
type NpCbcDec = cbc::Decryptor<aes::Aes128>;

/// CRC-8, polynomial 0x07, zero init. A packet with its CRC appended sums to zero.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

pub const VERSION: u8 = 1;
pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const PAD: usize = 16;
pub const SIG_LEN: usize = 32;
pub const MAX_PACKET: usize = 128;
/// `format | reg_key | iv`
pub const ENCAPS_LEN: usize = 1 + 4 + IV_LEN;
/// `ver | op | seq | time`
pub const HEAD_LEN: usize = 8;
/// `format | error | dsn_len`
pub const DSN_ENCAPS_LEN: usize = 3;
pub const ERR_NONE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    Dsn = 1,
    Key = 2,
    IvKey = 3,
    DsnErr = 4,
    KeyErr = 5,
}

impl Format {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Dsn,
            2 => Self::Key,
            3 => Self::IvKey,
            4 => Self::DsnErr,
            5 => Self::KeyErr,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Reg = 1,
    RegResp = 2,
    ReqPing = 3,
    ReqPingResp = 4,
    Ping = 5,
    PingResp = 6,
    KeepAlive = 7,
    KeepAliveResp = 8,
    Notify = 9,
    NotifyResp = 10,
    Unreg = 11,
    UnregResp = 12,
}

impl Op {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Reg,
            2 => Self::RegResp,
            3 => Self::ReqPing,
            4 => Self::ReqPingResp,
            5 => Self::Ping,
            6 => Self::PingResp,
            7 => Self::KeepAlive,
            8 => Self::KeepAliveResp,
            9 => Self::Notify,
            10 => Self::NotifyResp,
            11 => Self::Unreg,
            12 => Self::UnregResp,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("packet too long: {0} bytes")]
    TooLong(usize),
    #[error("unexpected format {0:#x}")]
    Format(u8),
    #[error("bad version {0:#x}")]
    Version(u8),
    #[error("unknown op {0:#x}")]
    Op(u8),
    #[error("bad crc")]
    Crc,
    #[error("bad key length {0}")]
    KeyLength(usize),
    #[error("bad dsn")]
    Dsn,
    #[error("sequence {0} not outstanding")]
    Sequence(u16),
    #[error("bad signature")]
    Signature,
}

/// A decrypted keyed packet. `body` holds the op-specific fields and any
/// zero padding, without the trailing CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub reg_key: u32,
    pub op: Op,
    pub seq: u16,
    pub time: u32,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(op: Op, seq: u16, time: u32, reg_key: u32) -> Self {
        Self { reg_key, op, seq, time, body: Vec::new() }
    }

    pub fn with_u8(mut self, value: u8) -> Self {
        self.body.push(value);
        self
    }

    pub fn with_u16(mut self, value: u16) -> Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Error byte of a response; padding makes it present in every packet.
    pub fn error(&self) -> u8 {
        self.body.first().copied().unwrap_or(ERR_NONE)
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        match self.body.get(offset..offset + 2) {
            Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
            None => 0,
        }
    }

    /// Encrypts the packet under `key` with `iv`, appending pad and CRC.
    pub fn encode(&self, key: &[u8], iv: &[u8; IV_LEN]) -> Result<Vec<u8>, PacketError> {
        if key.len() != KEY_LEN {
            return Err(PacketError::KeyLength(key.len()));
        }
        let mut plain = Vec::with_capacity(MAX_PACKET);
        plain.push(VERSION);
        plain.push(self.op as u8);
        plain.extend_from_slice(&self.seq.to_be_bytes());
        plain.extend_from_slice(&self.time.to_be_bytes());
        plain.extend_from_slice(&self.body);
        let pad = (plain.len() + 1).wrapping_neg() % PAD;
        plain.resize(plain.len() + pad, 0);
        plain.push(CRC8.checksum(&plain));
        if ENCAPS_LEN + plain.len() > MAX_PACKET {
            return Err(PacketError::TooLong(ENCAPS_LEN + plain.len()));
        }

        let mut enc = NpCbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
        for block in plain.chunks_exact_mut(PAD) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        let mut out = Vec::with_capacity(ENCAPS_LEN + plain.len());
        out.push(Format::IvKey as u8);
        out.extend_from_slice(&self.reg_key.to_be_bytes());
        out.extend_from_slice(iv);
        out.extend_from_slice(&plain);
        Ok(out)
    }

    /// Decrypts and checks a keyed packet.
    pub fn decode(buf: &[u8], key: &[u8]) -> Result<Self, PacketError> {
        if key.len() != KEY_LEN {
            return Err(PacketError::KeyLength(key.len()));
        }
        let format = *buf.first().ok_or(PacketError::TooShort(0))?;
        if Format::from_u8(format) != Some(Format::IvKey) {
            return Err(PacketError::Format(format));
        }
        if buf.len() < ENCAPS_LEN + PAD || (buf.len() - ENCAPS_LEN) % PAD != 0 {
            return Err(PacketError::TooShort(buf.len()));
        }
        let reg_key = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let iv = GenericArray::from_slice(&buf[5..ENCAPS_LEN]);

        let mut plain = buf[ENCAPS_LEN..].to_vec();
        let mut dec = NpCbcDec::new(GenericArray::from_slice(key), iv);
        for block in plain.chunks_exact_mut(PAD) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        if plain[0] != VERSION {
            return Err(PacketError::Version(plain[0]));
        }
        if CRC8.checksum(&plain) != 0 {
            return Err(PacketError::Crc);
        }
        let op = Op::from_u8(plain[1]).ok_or(PacketError::Op(plain[1]))?;
        Ok(Self {
            reg_key,
            op,
            seq: u16::from_be_bytes([plain[2], plain[3]]),
            time: u32::from_be_bytes([plain[4], plain[5], plain[6], plain[7]]),
            body: plain[HEAD_LEN..plain.len() - 1].to_vec(),
        })
    }
}

/// Format byte of a received datagram.
pub fn peek_format(buf: &[u8]) -> Result<Format, PacketError> {
    let format = *buf.first().ok_or(PacketError::TooShort(0))?;
    Format::from_u8(format).ok_or(PacketError::Format(format))
}

fn sign(payload: &[u8], key: &[u8]) -> [u8; SIG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(key);
    hasher.finalize().into()
}

/// NUL-terminated DSN padded to a four byte boundary.
fn dsn_field(dsn: &str) -> Result<Vec<u8>, PacketError> {
    let mut field = dsn.as_bytes().to_vec();
    if field.contains(&0) {
        return Err(PacketError::Dsn);
    }
    field.push(0);
    field.resize(field.len() + field.len().wrapping_neg() % 4, 0);
    if field.len() > usize::from(u8::MAX) {
        return Err(PacketError::Dsn);
    }
    Ok(field)
}

fn register_payload(format: Format, dsn: &[u8], seq: u16, time: u32, ping_delay: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DSN_ENCAPS_LEN + dsn.len() + HEAD_LEN + 2 + SIG_LEN);
    buf.push(format as u8);
    buf.push(ERR_NONE);
    buf.push(dsn.len() as u8);
    buf.extend_from_slice(dsn);
    buf.push(VERSION);
    buf.push(Op::Reg as u8);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&time.to_be_bytes());
    buf.extend_from_slice(&ping_delay.to_be_bytes());
    buf
}

/// Builds the signed registration request.
pub fn encode_register(dsn: &str, seq: u16, time: u32, ping_delay: u16, key: &[u8]) -> Result<Vec<u8>, PacketError> {
    let field = dsn_field(dsn)?;
    let mut buf = register_payload(Format::Dsn, &field, seq, time, ping_delay);
    let signature = sign(&buf, key);
    buf.extend_from_slice(&signature);
    if buf.len() > MAX_PACKET {
        return Err(PacketError::TooLong(buf.len()));
    }
    Ok(buf)
}

/// Validates a registration rejection, which echoes our request with the
/// `DsnErr` format. The signature is checked over the request as sent.
pub fn check_register_error(buf: &[u8], dsn: &str, seq: u16, key: &[u8]) -> Result<(), PacketError> {
    let min = DSN_ENCAPS_LEN + HEAD_LEN + 2 + SIG_LEN;
    if buf.len() < min {
        return Err(PacketError::TooShort(buf.len()));
    }
    let dsn_len = usize::from(buf[2]);
    let len = min + dsn_len;
    if dsn_len == 0 || buf.len() < len {
        return Err(PacketError::TooShort(buf.len()));
    }
    let field = &buf[DSN_ENCAPS_LEN..DSN_ENCAPS_LEN + dsn_len];
    if field.last() != Some(&0) {
        return Err(PacketError::Dsn);
    }
    let name_len = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    if &field[..name_len] != dsn.as_bytes() {
        return Err(PacketError::Dsn);
    }
    let head = &buf[DSN_ENCAPS_LEN + dsn_len..];
    if head[0] != VERSION {
        return Err(PacketError::Version(head[0]));
    }
    if head[1] != Op::Reg as u8 {
        return Err(PacketError::Op(head[1]));
    }
    let got = u16::from_be_bytes([head[2], head[3]]);
    if got != seq {
        return Err(PacketError::Sequence(got));
    }
    let mut signed = buf[..len - SIG_LEN].to_vec();
    signed[0] = Format::Dsn as u8;
    if sign(&signed, key)[..] != buf[len - SIG_LEN..len] {
        return Err(PacketError::Signature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = *b"0123456789012345";
    const IV: [u8; IV_LEN] = [9u8; IV_LEN];

    #[test]
    fn keyed_packet_is_padded_encrypted_and_checked() {
        let packet = Packet::new(Op::KeepAlive, 0x1234, 99, 0xdead_beef).with_u16(40);
        let wire = packet.encode(&KEY, &IV).expect("encode");
        assert_eq!((wire.len() - ENCAPS_LEN) % PAD, 0);
        assert_eq!(peek_format(&wire), Ok(Format::IvKey));
        assert_eq!(&wire[1..5], &0xdead_beef_u32.to_be_bytes());

        assert_eq!(&wire[5..ENCAPS_LEN], &IV);
        let decoded = Packet::decode(&wire, &KEY).expect("decode");
        assert_eq!(decoded.op, Op::KeepAlive);
        assert_eq!(decoded.seq, 0x1234);
        assert_eq!(decoded.u16_at(0), 40);
    }

    #[test]
    fn corrupted_ciphertext_fails_version_or_crc() {
        let wire = Packet::new(Op::Ping, 7, 0, 1).encode(&KEY, &IV).expect("encode");
        let mut bad = wire.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert!(matches!(Packet::decode(&bad, &KEY), Err(PacketError::Crc | PacketError::Version(_))));

        let other_key = [1u8; KEY_LEN];
        assert!(Packet::decode(&wire, &other_key).is_err());
        assert_eq!(Packet::decode(&wire, &KEY[..8]), Err(PacketError::KeyLength(8)));
    }

    #[test]
    fn register_rejection_must_echo_a_signed_request() {
        let wire = encode_register("AC000W000000001", 42, 5, 20, &KEY).expect("register");
        // "AC000W000000001\0" is already 4-aligned.
        assert_eq!(wire[2], 16);
        assert_eq!(wire.len(), DSN_ENCAPS_LEN + 16 + HEAD_LEN + 2 + SIG_LEN);

        let mut rejection = wire.clone();
        rejection[0] = Format::DsnErr as u8;
        assert_eq!(check_register_error(&rejection, "AC000W000000001", 42, &KEY), Ok(()));
        assert_eq!(check_register_error(&rejection, "AC000W000000002", 42, &KEY), Err(PacketError::Dsn));
        assert_eq!(check_register_error(&rejection, "AC000W000000001", 43, &KEY), Err(PacketError::Sequence(42)));
        assert_eq!(
            check_register_error(&rejection, "AC000W000000001", 42, &[0u8; KEY_LEN]),
            Err(PacketError::Signature)
        );
    }

    #[test]
    fn dsn_field_rejects_embedded_nul() {
        assert_eq!(encode_register("bad\0dsn", 1, 0, 20, &KEY), Err(PacketError::Dsn));
        assert_eq!(dsn_field("abc").expect("dsn"), b"abc\0".to_vec());
        assert_eq!(dsn_field("abcd").expect("dsn").len(), 8);
    }
}
