//! Disk blocks: what was read, how it was transformed, and where it landed.

pub mod buffer_pool;
pub mod digest;
pub mod dump;
pub mod transform;

use crate::backup::block::digest::{BlockDigest, STRONG_DIGEST_LEN};
use crate::backup::generation::disk::DumpStatistics;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockFlags {
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub ciphered: bool,
    /// Read from a changed extent of an incremental dump
    #[serde(default)]
    pub modified: bool,
    /// Target already held the payload
    #[serde(default)]
    pub duplicated: bool,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct BlockDescriptor {
    #[getset(get_copy = "pub")]
    index: u32,
    #[getset(get_copy = "pub")]
    disk_id: u32,
    #[getset(get_copy = "pub")]
    offset: u64,
    /// Raw bytes read from the disk
    #[getset(get_copy = "pub")]
    length: u32,
    #[getset(get_copy = "pub")]
    total_blocks: u32,
    /// Bytes after every transform that ran
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    stored_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[getset(get_copy = "pub")]
    fast_digest: Option<u64>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[getset(get_copy = "pub")]
    strong_digest: Option<[u8; STRONG_DIGEST_LEN]>,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    flags: BlockFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[getset(get_copy = "pub")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[getset(get_copy = "pub")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[getset(get = "pub")]
    failure: Option<String>,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    attempts: u32,
}

impl BlockDescriptor {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn digest(&self) -> Option<BlockDigest> {
        Some(BlockDigest {
            fast: self.fast_digest?,
            strong: self.strong_digest?,
        })
    }

    /// Storage key of the payload.
    pub fn strong_hex(&self) -> Option<String> {
        self.strong_digest.map(hex::encode)
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.started_at.get_or_insert_with(Utc::now);
        self.failure = None;
    }

    pub(crate) fn record_transform(&mut self, digest: BlockDigest, stored_size: u32, flags: BlockFlags) {
        self.fast_digest = Some(digest.fast);
        self.strong_digest = Some(digest.strong);
        self.stored_size = stored_size;
        self.flags = flags;
    }

    pub(crate) fn mark_duplicated(&mut self, duplicated: bool) {
        self.flags.duplicated = duplicated;
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}

/// Descriptors of one disk of one generation, keyed by block index.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Getters, CopyGetters)]
pub struct BlockMap {
    #[getset(get_copy = "pub")]
    disk_id: u32,
    #[getset(get = "pub")]
    blocks: BTreeMap<u32, BlockDescriptor>,
}

impl BlockMap {
    pub fn new(disk_id: u32) -> Self {
        Self {
            disk_id,
            blocks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, descriptor: BlockDescriptor) -> Option<BlockDescriptor> {
        self.blocks.insert(descriptor.index(), descriptor)
    }

    pub fn get(&self, index: u32) -> Option<&BlockDescriptor> {
        self.blocks.get(&index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn failed_blocks(&self) -> impl Iterator<Item = &BlockDescriptor> {
        self.blocks.values().filter(|b| b.is_failed())
    }

    /// Every index in `0..expected` is present and none failed.
    pub fn is_complete(&self, expected: u32) -> bool {
        self.blocks.len() == expected as usize
            && (0..expected).all(|i| self.blocks.get(&i).is_some_and(|b| !b.is_failed()))
    }

    pub fn statistics(&self) -> DumpStatistics {
        self.blocks
            .values()
            .filter(|b| !b.is_failed())
            .fold(DumpStatistics::default(), |mut stats, b| {
                stats.blocks += 1;
                stats.raw_bytes += b.length() as u64;
                stats.stored_bytes += b.stored_size() as u64;
                if b.flags().duplicated {
                    stats.duplicated_blocks += 1;
                }
                stats
            })
    }
}

/// Contiguous byte range of a disk.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

/// Splits `extents` into blocks of at most `block_size` bytes, in order.
pub fn plan_blocks(extents: &[Extent], block_size: u32) -> Vec<(u64, u32)> {
    let block_size = block_size.max(1) as u64;
    extents
        .iter()
        .flat_map(|extent| {
            let end = extent.offset + extent.length;
            (extent.offset..end)
                .step_by(block_size as usize)
                .map(move |offset| (offset, (end - offset).min(block_size) as u32))
        })
        .collect()
}
