pub mod aes_gcm;

use crate::backup::encrypt::aes_gcm::AesGcmConfig;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use ::aes_gcm::Aes256Gcm;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::result;
use validator::{Validate, ValidationErrors};

/// The symmetric cipher shared by every dump worker of the process.
pub enum BlockCipher {
    None,
    Aes256Gcm(Box<Aes256Gcm>),
}

impl Debug for BlockCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockCipher::None => f.write_str("None"),
            BlockCipher::Aes256Gcm(_) => f.write_str("Aes256Gcm"),
        }
    }
}

impl BlockCipher {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, BlockCipher::None)
    }

    pub fn encrypt_into(&self, plain: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            BlockCipher::None => {
                out.clear();
                out.extend_from_slice(plain);
                Ok(())
            }
            BlockCipher::Aes256Gcm(cipher) => aes_gcm::seal_into(cipher, plain, out),
        }
    }

    pub fn decrypt_into(&self, sealed: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            BlockCipher::None => {
                out.clear();
                out.extend_from_slice(sealed);
                Ok(())
            }
            BlockCipher::Aes256Gcm(cipher) => aes_gcm::open_into(cipher, sealed, out),
        }
    }
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "encryptor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EncryptorConfig {
    #[default]
    None,
    Aes256Gcm(AesGcmConfig),
}

impl Validate for EncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            EncryptorConfig::None => Ok(()),
            EncryptorConfig::Aes256Gcm(inner) => inner.validate(),
        }
    }
}

pub trait CipherBuilder {
    fn build_cipher(&self) -> Result<BlockCipher>;
}

impl CipherBuilder for EncryptorConfig {
    fn build_cipher(&self) -> Result<BlockCipher> {
        match self {
            EncryptorConfig::None => {
                tracing::info!("Using no encryption");
                Ok(BlockCipher::None)
            }
            EncryptorConfig::Aes256Gcm(aes) => {
                tracing::info!("Initializing AES-256-GCM block encryption");
                aes.build_cipher()
            }
        }
        .with_debug_object_and_fn_name(self.clone(), "build_cipher")
    }
}
