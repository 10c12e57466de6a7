//! Where catalogs, block payloads, and block maps are stored.

pub mod file;
pub mod memory;

use crate::backup::block::{BlockDescriptor, BlockMap};
use crate::backup::generation::catalog::GenerationsCatalog;
use crate::backup::generation::GenerationId;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::fmt::Debug;

/// How the target handled a posted block payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAck {
    Stored,
    /// Identical content was already present; nothing was written
    Duplicated,
}

#[derive(Clone, Debug, Display, PartialEq, Eq)]
#[display("{kind}:{location}")]
pub struct TargetInfo {
    pub kind: TargetKind,
    pub location: String,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum TargetKind {
    #[display("file")]
    File,
    #[display("memory")]
    Memory,
}

pub trait RepositoryTarget: Send + Sync + Debug {
    fn parent(&self) -> TargetInfo;

    fn profile_exists(&self, entity_uuid: &str) -> Result<bool>;

    fn create_profile_folder(&self, catalog: &GenerationsCatalog) -> Result<()>;

    fn get_generations_catalog(&self, entity_uuid: &str) -> Result<Vec<u8>>;

    /// `false` when the target refused the document.
    fn post_generations_catalog(&self, entity_uuid: &str, bytes: &[u8]) -> Result<bool>;

    fn post_block(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        descriptor: &BlockDescriptor,
        payload: &[u8],
    ) -> Result<BlockAck>;

    fn get_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<Vec<u8>>;

    fn post_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        map: &BlockMap,
    ) -> Result<()>;

    /// `None` when generation `generation_id` has no map for `disk_id`.
    fn find_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<Option<BlockMap>>;

    fn get_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<BlockMap> {
        self.find_block_map(entity_uuid, generation_id, disk_id)?
            .ok_or(Error::BlockMapNotFound {
                generation_id,
                disk_id,
            })
    }

    /// Returns `false` when there was no such map.
    fn remove_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<bool>;

    /// Deletes the payload of `descriptor`, whichever block maps still name
    /// it. Returns `false` when no payload was stored.
    fn remove_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<bool>;
}

/// Entity uuids become path components and map keys.
pub(crate) fn checked_entity_uuid(entity_uuid: &str) -> Result<&str> {
    if entity_uuid.is_empty()
        || entity_uuid == "."
        || entity_uuid == ".."
        || entity_uuid.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidEntityUuid(entity_uuid.to_string()));
    }
    Ok(entity_uuid)
}

/// Payload key of a transformed block.
pub(crate) fn payload_key(descriptor: &BlockDescriptor) -> Result<String> {
    descriptor.strong_hex().ok_or(Error::MissingDigest {
        disk_id: descriptor.disk_id(),
        index: descriptor.index(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_uuid_must_be_a_single_component() {
        assert!(checked_entity_uuid("5003b6f2-aaaa").is_ok());
        assert!(checked_entity_uuid("").is_err());
        assert!(checked_entity_uuid("..").is_err());
        assert!(checked_entity_uuid("a/b").is_err());
        assert!(checked_entity_uuid("a\\b").is_err());
    }

    #[test]
    fn test_target_info_display() {
        let info = TargetInfo {
            kind: TargetKind::File,
            location: "/srv/backup".into(),
        };
        assert_eq!(info.to_string(), "file:/srv/backup");
    }
}
