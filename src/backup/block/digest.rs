use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_64;

pub const STRONG_DIGEST_LEN: usize = 32;

/// Fast and strong digests of the same byte sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDigest {
    pub fast: u64,
    pub strong: [u8; STRONG_DIGEST_LEN],
}

impl BlockDigest {
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            fast: xxh3_64(bytes),
            strong: hasher.finalize().into(),
        }
    }

    /// Cheap check first, SHA-256 only when xxh3 agrees.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        xxh3_64(bytes) == self.fast && Self::compute(bytes).strong == self.strong
    }

    pub fn strong_hex(&self) -> String {
        hex::encode(self.strong)
    }
}
