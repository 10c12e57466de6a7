use crate::backup::block::buffer_pool::{BufferSlot, Region};
use crate::backup::block::digest::BlockDigest;
use crate::backup::block::{BlockDescriptor, BlockFlags};
use crate::backup::compress::{xz_decompress_into, CompressorConfig};
use crate::backup::encrypt::BlockCipher;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::sync::Arc;

/// What `process` left in the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformOutcome {
    pub digest: BlockDigest,
    pub flags: BlockFlags,
    /// Region holding the bytes to store
    pub staged: Region,
    pub stored_size: usize,
}

/// Compress, then encrypt, then digest the on-wire bytes; and the inverse.
#[derive(Debug, Clone)]
pub struct BlockTransformer {
    compressor: CompressorConfig,
    cipher: Arc<BlockCipher>,
}

fn check_region(slot: &BufferSlot, region: Region) -> Result<()> {
    let needed = slot.region(region).len();
    if needed > slot.capacity() {
        return Err(Error::RegionOverflow {
            region: region.name(),
            needed,
            capacity: slot.capacity(),
        });
    }
    Ok(())
}

impl BlockTransformer {
    pub fn new(compressor: CompressorConfig, cipher: Arc<BlockCipher>) -> Self {
        Self { compressor, cipher }
    }

    /// Transforms the raw bytes in the slot's input region.
    pub fn process(&self, slot: &mut BufferSlot) -> Result<TransformOutcome> {
        check_region(slot, Region::Input)?;
        let mut staged = Region::Input;
        let mut flags = BlockFlags::default();

        if self.compressor.is_enabled() {
            self.compressor
                .compress_into(&slot.input, &mut slot.compressed)?;
            check_region(slot, Region::Compressed)?;
            staged = Region::Compressed;
            flags.compressed = true;
        }

        if self.cipher.is_enabled() {
            let plain = match staged {
                Region::Compressed => &slot.compressed,
                _ => &slot.input,
            };
            self.cipher.encrypt_into(plain, &mut slot.ciphered)?;
            check_region(slot, Region::Ciphered)?;
            staged = Region::Ciphered;
            flags.ciphered = true;
        }

        let bytes = slot.region(staged);
        Ok(TransformOutcome {
            digest: BlockDigest::compute(bytes),
            flags,
            staged,
            stored_size: bytes.len(),
        })
    }

    /// Verifies `payload` against the digests of `descriptor`, then undoes
    /// the transforms its flags record. The raw block ends up in the slot's
    /// output region.
    pub fn decode(
        &self,
        descriptor: &BlockDescriptor,
        payload: &[u8],
        slot: &mut BufferSlot,
    ) -> Result<()> {
        let (disk_id, index) = (descriptor.disk_id(), descriptor.index());
        let digest = descriptor
            .digest()
            .ok_or(Error::MissingDigest { disk_id, index })?;
        if !digest.matches(payload) {
            return Err(Error::DigestMismatch { disk_id, index });
        }

        let flags = descriptor.flags();
        let mut current = payload;
        if flags.ciphered {
            if !self.cipher.is_enabled() {
                return Err(Error::Cipher(format!(
                    "block {index} of disk {disk_id} is encrypted but no key is configured"
                )));
            }
            self.cipher.decrypt_into(current, &mut slot.ciphered)?;
            check_region(slot, Region::Ciphered)?;
            current = &slot.ciphered;
        }

        if flags.compressed {
            xz_decompress_into(current, &mut slot.output)?;
        } else {
            slot.output.clear();
            slot.output.extend_from_slice(current);
        }
        check_region(slot, Region::Output)?;

        let expected = descriptor.length() as usize;
        if slot.output.len() != expected {
            return Err(Error::LengthMismatch {
                disk_id,
                index,
                expected,
                actual: slot.output.len(),
            });
        }
        Ok(())
    }
}
