use super::LanError;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type AesCbcEnc = cbc::Encryptor<aes::Aes256>;
type AesCbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// `HMAC(secret, HMAC(secret, seed) || seed)` over SHA-256.
///
/// Peers implement exactly this two-round construction, so it must not be
/// replaced by a standard TLS PRF.
pub fn prf(secret: &[u8], seed: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    // HMAC accepts keys of any length.
    let Ok(keyed) = HmacSha256::new_from_slice(secret) else {
        return out;
    };
    let mut first = keyed.clone();
    first.update(seed);
    let a1 = first.finalize().into_bytes();
    let mut second = keyed;
    second.update(&a1);
    second.update(seed);
    out.copy_from_slice(&second.finalize().into_bytes());
    out
}

fn sign(key: &[u8], data: &[u8]) -> Result<Vec<u8>, LanError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| LanError::KeyMismatch)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Seed roots for both directions of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roots {
    pub module: String,
    pub app: String,
}

impl Roots {
    /// `random_1`/`time_1` come from the module, `random_2`/`time_2` from the client.
    pub fn new(random_1: &str, time_1: u64, random_2: &str, time_2: i64) -> Self {
        Self {
            module: format!("{random_2}{random_1}{time_2}{time_1}"),
            app: format!("{random_1}{random_2}{time_1}{time_2}"),
        }
    }
}

fn derive(secret: &[u8], root: &str, suffix: &str) -> Zeroizing<[u8; KEY_LEN]> {
    prf(secret, format!("{root}{suffix}").as_bytes())
}

/// Keys and chained cipher state of one LAN session.
///
/// The local side signs and encrypts with keys derived from `local_root`
/// and verifies and decrypts with keys derived from `peer_root`.
pub struct SessionKeys {
    sign_key: Zeroizing<[u8; KEY_LEN]>,
    verify_key: Zeroizing<[u8; KEY_LEN]>,
    enc: AesCbcEnc,
    dec: AesCbcDec,
}

impl SessionKeys {
    pub fn derive(secret: &[u8], local_root: &str, peer_root: &str) -> Self {
        let enc_key = derive(secret, local_root, "1");
        let enc_iv = derive(secret, local_root, "2");
        let dec_key = derive(secret, peer_root, "1");
        let dec_iv = derive(secret, peer_root, "2");
        Self {
            sign_key: derive(secret, local_root, "0"),
            verify_key: derive(secret, peer_root, "0"),
            enc: AesCbcEnc::new(GenericArray::from_slice(&enc_key[..]), GenericArray::from_slice(&enc_iv[..IV_LEN])),
            dec: AesCbcDec::new(GenericArray::from_slice(&dec_key[..]), GenericArray::from_slice(&dec_iv[..IV_LEN])),
        }
    }

    /// Module side of an exchange.
    pub fn for_module(secret: &[u8], roots: &Roots) -> Self {
        Self::derive(secret, &roots.module, &roots.app)
    }

    /// Signs, zero-pads and encrypts `{"seq_no", "data"}`, returning the
    /// `{"enc", "sign"}` envelope. The cipher chain carries over to the next call.
    pub fn encaps(&mut self, seq_no: u64, data: &Value) -> Result<Value, LanError> {
        let plain = serde_json::to_vec(&json!({"seq_no": seq_no, "data": data}))
            .map_err(|_| LanError::Decode("payload"))?;
        let signature = sign(&self.sign_key[..], &plain)?;

        let mut buf = plain;
        let pad = buf.len().wrapping_neg() % BLOCK_LEN;
        buf.resize(buf.len() + pad, 0);
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            self.enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(json!({"enc": BASE64.encode(&buf), "sign": BASE64.encode(signature)}))
    }

    /// Decrypts and verifies an envelope. The session state only advances when
    /// the packet verifies.
    pub fn decaps(&mut self, envelope: &Value) -> Result<Value, LanError> {
        let field = |name: &'static str| {
            envelope
                .get(name)
                .and_then(Value::as_str)
                .ok_or(LanError::Decode(name))
                .and_then(|text| BASE64.decode(text).map_err(|_| LanError::Decode(name)))
        };
        let mut buf = field("enc")?;
        let signature = field("sign")?;
        if buf.is_empty() || buf.len() % BLOCK_LEN != 0 {
            return Err(LanError::Decode("enc"));
        }

        let mut dec = self.dec.clone();
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        let len = buf.iter().rposition(|byte| *byte != 0).map_or(0, |last| last + 1);
        buf.truncate(len);
        if std::str::from_utf8(&buf).is_err() {
            return Err(LanError::KeyMismatch);
        }

        let mut mac = HmacSha256::new_from_slice(&self.verify_key[..]).map_err(|_| LanError::KeyMismatch)?;
        mac.update(&buf);
        mac.verify_slice(&signature).map_err(|_| LanError::SignatureMismatch)?;

        let plain: Value = serde_json::from_slice(&buf).map_err(|_| LanError::Decode("plaintext"))?;
        self.dec = dec;
        Ok(plain)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
