use crate::backup::block::{BlockDescriptor, BlockMap};
use crate::backup::generation::catalog::GenerationsCatalog;
use crate::backup::generation::GenerationId;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::target::{
    checked_entity_uuid, payload_key, BlockAck, RepositoryTarget, TargetInfo, TargetKind,
};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Store {
    profiles: HashSet<String>,
    catalogs: HashMap<String, Vec<u8>>,
    blocks: HashMap<(String, String), Vec<u8>>,
    block_maps: HashMap<(String, GenerationId, u32), Vec<u8>>,
}

/// Process-local target. Backs TEMPORARY sessions and tests; it can be told
/// to fail block posts or refuse catalogs.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    store: Mutex<Store>,
    failing_block_posts: AtomicU32,
    refuse_catalogs: AtomicBool,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` calls to `post_block` fail with an I/O error.
    pub fn fail_next_block_posts(&self, count: u32) {
        self.failing_block_posts.store(count, Ordering::SeqCst);
    }

    pub fn refuse_catalogs(&self, refuse: bool) {
        self.refuse_catalogs.store(refuse, Ordering::SeqCst);
    }

    pub fn has_profile_folder(&self, entity_uuid: &str) -> bool {
        self.store().profiles.contains(entity_uuid)
    }

    pub fn stored_block_count(&self) -> usize {
        self.store().blocks.len()
    }

    /// Overwrites a stored catalog document, bypassing every check.
    pub fn put_raw_catalog(&self, entity_uuid: &str, bytes: &[u8]) {
        let mut store = self.store();
        store.profiles.insert(entity_uuid.to_string());
        store.catalogs.insert(entity_uuid.to_string(), bytes.to_vec());
    }

    /// Flips one byte of the stored payload of `descriptor`.
    pub fn corrupt_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<()> {
        let key = (entity_uuid.to_string(), payload_key(descriptor)?);
        match self.store().blocks.get_mut(&key).and_then(|p| p.first_mut()) {
            Some(byte) => {
                *byte ^= 0xFF;
                Ok(())
            }
            None => Err(not_found(&key.1)),
        }
    }
}

fn not_found(what: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotFound, format!("{what} not found")))
}

impl RepositoryTarget for MemoryTarget {
    fn parent(&self) -> TargetInfo {
        TargetInfo {
            kind: TargetKind::Memory,
            location: format!("{:p}", self),
        }
    }

    fn profile_exists(&self, entity_uuid: &str) -> Result<bool> {
        let entity_uuid = checked_entity_uuid(entity_uuid)?;
        Ok(self.store().catalogs.contains_key(entity_uuid))
    }

    fn create_profile_folder(&self, catalog: &GenerationsCatalog) -> Result<()> {
        let entity_uuid = checked_entity_uuid(catalog.entity().uuid())?;
        self.store().profiles.insert(entity_uuid.to_string());
        Ok(())
    }

    fn get_generations_catalog(&self, entity_uuid: &str) -> Result<Vec<u8>> {
        let entity_uuid = checked_entity_uuid(entity_uuid)?;
        self.store()
            .catalogs
            .get(entity_uuid)
            .cloned()
            .ok_or_else(|| not_found(&format!("catalog of {entity_uuid}")))
    }

    fn post_generations_catalog(&self, entity_uuid: &str, bytes: &[u8]) -> Result<bool> {
        let entity_uuid = checked_entity_uuid(entity_uuid)?;
        if self.refuse_catalogs.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut store = self.store();
        store.profiles.insert(entity_uuid.to_string());
        store.catalogs.insert(entity_uuid.to_string(), bytes.to_vec());
        Ok(true)
    }

    fn post_block(
        &self,
        entity_uuid: &str,
        _generation_id: GenerationId,
        descriptor: &BlockDescriptor,
        payload: &[u8],
    ) -> Result<BlockAck> {
        let entity_uuid = checked_entity_uuid(entity_uuid)?;
        let failing = self
            .failing_block_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Io(io::Error::other("injected block post failure")));
        }

        let key = (entity_uuid.to_string(), payload_key(descriptor)?);
        let mut store = self.store();
        if store
            .blocks
            .get(&key)
            .is_some_and(|stored| stored.len() == payload.len())
        {
            return Ok(BlockAck::Duplicated);
        }
        store.blocks.insert(key, payload.to_vec());
        Ok(BlockAck::Stored)
    }

    fn get_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<Vec<u8>> {
        let key = (
            checked_entity_uuid(entity_uuid)?.to_string(),
            payload_key(descriptor)?,
        );
        self.store()
            .blocks
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(&key.1))
    }

    fn post_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        map: &BlockMap,
    ) -> Result<()> {
        let entity_uuid = checked_entity_uuid(entity_uuid)?;
        let bytes = serde_json::to_vec(map)?;
        self.store()
            .block_maps
            .insert((entity_uuid.to_string(), generation_id, map.disk_id()), bytes);
        Ok(())
    }

    fn find_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<Option<BlockMap>> {
        let key = (checked_entity_uuid(entity_uuid)?.to_string(), generation_id, disk_id);
        match self.store().block_maps.get(&key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn remove_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<bool> {
        let key = (checked_entity_uuid(entity_uuid)?.to_string(), generation_id, disk_id);
        Ok(self.store().block_maps.remove(&key).is_some())
    }

    fn remove_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<bool> {
        let key = (
            checked_entity_uuid(entity_uuid)?.to_string(),
            payload_key(descriptor)?,
        );
        Ok(self.store().blocks.remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::block::digest::BlockDigest;
    use crate::backup::block::BlockFlags;

    fn descriptor(payload: &[u8]) -> BlockDescriptor {
        let mut descriptor = BlockDescriptor::builder()
            .index(0)
            .disk_id(0)
            .offset(0)
            .length(payload.len() as u32)
            .total_blocks(1)
            .build();
        descriptor.record_transform(
            BlockDigest::compute(payload),
            payload.len() as u32,
            BlockFlags::default(),
        );
        descriptor
    }

    #[test]
    fn test_same_payload_is_duplicated() {
        let target = MemoryTarget::new();
        let block = descriptor(b"payload");
        assert_eq!(target.post_block("e", 0, &block, b"payload").unwrap(), BlockAck::Stored);
        assert_eq!(
            target.post_block("e", 1, &block, b"payload").unwrap(),
            BlockAck::Duplicated
        );
        assert_eq!(target.stored_block_count(), 1);
        assert_eq!(target.get_block("e", &block).unwrap(), b"payload");
    }

    #[test]
    fn test_remove_block_and_map() {
        let target = MemoryTarget::new();
        let block = descriptor(b"payload");
        let mut map = BlockMap::new(0);
        map.insert(block.clone());
        target.post_block("e", 0, &block, b"payload").unwrap();
        target.post_block_map("e", 0, &map).unwrap();
        assert_eq!(target.find_block_map("e", 0, 0).unwrap(), Some(map));

        assert!(target.remove_block_map("e", 0, 0).unwrap());
        assert!(!target.remove_block_map("e", 0, 0).unwrap());
        assert_eq!(target.find_block_map("e", 0, 0).unwrap(), None);
        assert!(matches!(
            target.get_block_map("e", 0, 0).unwrap_err().root(),
            Error::BlockMapNotFound { .. }
        ));

        assert!(target.remove_block("e", &block).unwrap());
        assert!(!target.remove_block("e", &block).unwrap());
        assert_eq!(target.stored_block_count(), 0);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let target = MemoryTarget::new();
        let block = descriptor(b"x");
        target.fail_next_block_posts(2);
        assert!(target.post_block("e", 0, &block, b"x").is_err());
        assert!(target.post_block("e", 0, &block, b"x").is_err());
        assert!(target.post_block("e", 0, &block, b"x").is_ok());
    }

    #[test]
    fn test_refused_catalog_is_not_stored() {
        let target = MemoryTarget::new();
        target.refuse_catalogs(true);
        assert!(!target.post_generations_catalog("e", b"{}").unwrap());
        assert!(target.get_generations_catalog("e").is_err());
        assert!(!target.profile_exists("e").unwrap());
    }
}
