use super::{KeySealer, LanError};
use rand_core::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};

/// Seals the session secret with the client's PKCS#1 RSA public key,
/// v1.5 padding.
#[derive(Debug, Default, Clone, Copy)]
pub struct RsaSealer;

impl KeySealer for RsaSealer {
    fn seal(&self, public_key_pem: &str, secret: &[u8]) -> Result<Vec<u8>, LanError> {
        let key = RsaPublicKey::from_pkcs1_pem(public_key_pem).map_err(|err| LanError::Seal(err.to_string()))?;
        key.encrypt(&mut OsRng, Pkcs1v15Encrypt, secret).map_err(|err| LanError::Seal(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lan::{convert_pubkey_pem, SEALED_SECRET_LEN};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::RsaPrivateKey;

    #[test]
    fn client_private_key_opens_sealed_secret() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen");
        let der = private.to_public_key().to_pkcs1_der().expect("der");
        let pem = convert_pubkey_pem(&BASE64.encode(der.as_bytes()));

        let secret = [0x5au8; SEALED_SECRET_LEN];
        let sealed = RsaSealer.seal(&pem, &secret).expect("seal");
        assert_eq!(sealed.len(), 128);
        assert_ne!(sealed.as_slice(), secret.as_slice());
        assert_eq!(private.decrypt(Pkcs1v15Encrypt, &sealed).expect("decrypt"), secret);
    }

    #[test]
    fn garbage_key_fails_to_seal() {
        let pem = convert_pubkey_pem("bm90IGEga2V5");
        assert!(matches!(RsaSealer.seal(&pem, &[1, 2, 3]), Err(LanError::Seal(_))));
    }
}
