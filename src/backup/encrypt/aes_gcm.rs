use crate::backup::encrypt::BlockCipher;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bon::Builder;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Process-wide AES-256-GCM key, base64 encoded in the configuration file.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AesGcmConfig {
    #[validate(custom(function = validate_aes_key))]
    #[builder(into)]
    key: RedactedString,
}

fn decode_key(key: &RedactedString) -> Result<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(STANDARD.decode(key.inner().as_bytes())?))
}

fn validate_aes_key(key: &RedactedString) -> std::result::Result<(), ValidationError> {
    match decode_key(key) {
        Ok(bytes) if bytes.len() == KEY_LEN => Ok(()),
        Ok(bytes) => Err(ValidationError::new("InvalidKey").with_message(
            format!("key must be {KEY_LEN} bytes, got {}", bytes.len()).into(),
        )),
        Err(_) => Err(ValidationError::new("InvalidKey").with_message("key is not base64".into())),
    }
}

impl AesGcmConfig {
    pub fn build_cipher(&self) -> Result<BlockCipher> {
        let key = decode_key(&self.key)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| {
            Error::Cipher(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;
        Ok(BlockCipher::Aes256Gcm(Box::new(cipher)))
    }
}

/// Wire format: `[12-byte nonce][ciphertext][16-byte tag]`.
pub(crate) fn seal_into(cipher: &Aes256Gcm, plain: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    out.clear();
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(plain);
    let tag = cipher.encrypt_in_place_detached(
        Nonce::from_slice(&nonce_bytes),
        b"",
        &mut out[NONCE_LEN..],
    )?;
    out.extend_from_slice(&tag);
    Ok(())
}

pub(crate) fn open_into(cipher: &Aes256Gcm, sealed: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Cipher(format!(
            "sealed block too short: {} bytes",
            sealed.len()
        )));
    }
    let (nonce_bytes, rest) = sealed.split_at(NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

    out.clear();
    out.extend_from_slice(ciphertext);
    cipher.decrypt_in_place_detached(
        Nonce::from_slice(nonce_bytes),
        b"",
        out,
        Tag::from_slice(tag),
    )?;
    Ok(())
}
