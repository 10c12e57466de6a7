use crate::backup::block::{BlockDescriptor, BlockMap};
use crate::backup::generation::catalog::GenerationsCatalog;
use crate::backup::generation::GenerationId;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::target::{
    checked_entity_uuid, payload_key, BlockAck, RepositoryTarget, TargetInfo, TargetKind,
};
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const CATALOG_FILE_NAME: &str = "generations.json";
const BLOCKS_DIR_NAME: &str = "blocks";

/// Directory tree repository:
///
/// ```text
/// <root>/<entity uuid>/generations.json
/// <root>/<entity uuid>/blocks/<hex[0..2]>/<hex>
/// <root>/<entity uuid>/<generation>/disk-<id>.json
/// ```
#[derive(Clone, Debug)]
pub struct FileTarget {
    root: Arc<Path>,
}

impl FileTarget {
    pub fn new(root: impl Into<Arc<Path>>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profile_dir(&self, entity_uuid: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_entity_uuid(entity_uuid)?))
    }

    fn catalog_path(&self, entity_uuid: &str) -> Result<PathBuf> {
        Ok(self.profile_dir(entity_uuid)?.join(CATALOG_FILE_NAME))
    }

    fn block_path(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<PathBuf> {
        let key = payload_key(descriptor)?;
        Ok(self
            .profile_dir(entity_uuid)?
            .join(BLOCKS_DIR_NAME)
            .join(&key[..2])
            .join(key))
    }

    fn block_map_path(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<PathBuf> {
        Ok(self
            .profile_dir(entity_uuid)?
            .join(generation_id.to_string())
            .join(format!("disk-{disk_id}.json")))
    }
}

/// Writes next to `path` and renames over it, so readers never see a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Removes `path`, then its parent when that left the parent empty.
fn remove_file_and_empty_parent(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    if let Some(dir) = path.parent() {
        if fs::read_dir(dir)?.next().is_none() {
            fs::remove_dir(dir)?;
        }
    }
    Ok(true)
}

impl RepositoryTarget for FileTarget {
    fn parent(&self) -> TargetInfo {
        TargetInfo {
            kind: TargetKind::File,
            location: self.root.display().to_string(),
        }
    }

    fn profile_exists(&self, entity_uuid: &str) -> Result<bool> {
        Ok(self.catalog_path(entity_uuid)?.is_file())
    }

    fn create_profile_folder(&self, catalog: &GenerationsCatalog) -> Result<()> {
        let dir = self.profile_dir(catalog.entity().uuid())?;
        fs::create_dir_all(&dir)
            .map_err(Error::from)
            .with_msg(format!("Failed to create profile folder {dir:?}"))?;
        tracing::debug!("Profile folder {:?} ready", dir);
        Ok(())
    }

    fn get_generations_catalog(&self, entity_uuid: &str) -> Result<Vec<u8>> {
        let path = self.catalog_path(entity_uuid)?;
        fs::read(&path)
            .map_err(Error::from)
            .with_msg(format!("Failed to read catalog {path:?}"))
    }

    fn post_generations_catalog(&self, entity_uuid: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.catalog_path(entity_uuid)?;
        write_atomic(&path, bytes).with_msg(format!("Failed to write catalog {path:?}"))?;
        Ok(true)
    }

    fn post_block(
        &self,
        entity_uuid: &str,
        _generation_id: GenerationId,
        descriptor: &BlockDescriptor,
        payload: &[u8],
    ) -> Result<BlockAck> {
        let path = self.block_path(entity_uuid, descriptor)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() == payload.len() as u64 => {
                return Ok(BlockAck::Duplicated);
            }
            Ok(meta) => tracing::warn!(
                "Block {:?} holds {} bytes instead of {}, rewriting",
                path,
                meta.len(),
                payload.len()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::from(e)).with_msg(format!("Failed to stat block {path:?}"))
            }
        }
        write_atomic(&path, payload).with_msg(format!("Failed to write block {path:?}"))?;
        Ok(BlockAck::Stored)
    }

    fn get_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<Vec<u8>> {
        let path = self.block_path(entity_uuid, descriptor)?;
        fs::read(&path)
            .map_err(Error::from)
            .with_msg(format!("Failed to read block {path:?}"))
    }

    fn post_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        map: &BlockMap,
    ) -> Result<()> {
        let path = self.block_map_path(entity_uuid, generation_id, map.disk_id())?;
        write_atomic(&path, &serde_json::to_vec_pretty(map)?)
            .with_msg(format!("Failed to write block map {path:?}"))
    }

    fn find_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<Option<BlockMap>> {
        let path = self.block_map_path(entity_uuid, generation_id, disk_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::from(e))
                    .with_msg(format!("Failed to read block map {path:?}"))
            }
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn remove_block_map(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<bool> {
        let path = self.block_map_path(entity_uuid, generation_id, disk_id)?;
        remove_file_and_empty_parent(&path)
            .with_msg(format!("Failed to remove block map {path:?}"))
    }

    fn remove_block(&self, entity_uuid: &str, descriptor: &BlockDescriptor) -> Result<bool> {
        let path = self.block_path(entity_uuid, descriptor)?;
        remove_file_and_empty_parent(&path).with_msg(format!("Failed to remove block {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::block::digest::BlockDigest;
    use crate::backup::block::BlockFlags;
    use crate::backup::generation::{EntityInfo, EntityType};
    use tempfile::TempDir;

    fn catalog() -> GenerationsCatalog {
        GenerationsCatalog::new(
            EntityInfo::builder()
                .uuid("vm-1")
                .name("vm")
                .server_uuid("vc")
                .entity_type(EntityType::VirtualMachine)
                .build(),
        )
    }

    fn descriptor(index: u32, payload: &[u8]) -> BlockDescriptor {
        let mut descriptor = BlockDescriptor::builder()
            .index(index)
            .disk_id(3)
            .offset(index as u64 * 16)
            .length(payload.len() as u32)
            .total_blocks(2)
            .build();
        descriptor.record_transform(
            BlockDigest::compute(payload),
            payload.len() as u32,
            BlockFlags::default(),
        );
        descriptor
    }

    #[test]
    fn test_catalog_lives_in_profile_folder() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        let catalog = catalog();

        assert!(!target.profile_exists("vm-1").unwrap());
        target.create_profile_folder(&catalog).unwrap();
        assert!(dir.path().join("vm-1").is_dir());
        assert!(!target.profile_exists("vm-1").unwrap());

        assert!(target
            .post_generations_catalog("vm-1", &catalog.to_bytes().unwrap())
            .unwrap());
        assert!(target.profile_exists("vm-1").unwrap());
        assert!(dir.path().join("vm-1").join(CATALOG_FILE_NAME).is_file());

        let loaded =
            GenerationsCatalog::from_bytes(&target.get_generations_catalog("vm-1").unwrap())
                .unwrap();
        assert_eq!(loaded.entity(), catalog.entity());
    }

    #[test]
    fn test_blocks_are_content_addressed() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        let first = descriptor(0, b"same bytes");
        let second = descriptor(1, b"same bytes");

        assert_eq!(
            target.post_block("vm-1", 0, &first, b"same bytes").unwrap(),
            BlockAck::Stored
        );
        assert_eq!(
            target.post_block("vm-1", 0, &second, b"same bytes").unwrap(),
            BlockAck::Duplicated
        );

        let hex = first.strong_hex().unwrap();
        let path = dir
            .path()
            .join("vm-1")
            .join("blocks")
            .join(&hex[..2])
            .join(&hex);
        assert!(path.is_file());
        assert_eq!(target.get_block("vm-1", &second).unwrap(), b"same bytes");
    }

    #[test]
    fn test_block_map_round_trip() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        let mut map = BlockMap::new(3);
        map.insert(descriptor(0, b"a"));
        map.insert(descriptor(1, b"b"));

        target.post_block_map("vm-1", 4, &map).unwrap();
        assert!(dir.path().join("vm-1").join("4").join("disk-3.json").is_file());
        assert_eq!(target.get_block_map("vm-1", 4, 3).unwrap(), map);
        assert_eq!(target.find_block_map("vm-1", 4, 0).unwrap(), None);
        assert!(matches!(
            target.get_block_map("vm-1", 4, 0).unwrap_err().root(),
            Error::BlockMapNotFound {
                generation_id: 4,
                disk_id: 0
            }
        ));
    }

    #[test]
    fn test_removal_prunes_empty_folders() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        let block = descriptor(0, b"payload");
        let mut map = BlockMap::new(3);
        map.insert(block.clone());
        target.post_block("vm-1", 2, &block, b"payload").unwrap();
        target.post_block_map("vm-1", 2, &map).unwrap();

        assert!(target.remove_block_map("vm-1", 2, 3).unwrap());
        assert!(!dir.path().join("vm-1").join("2").exists());
        assert!(!target.remove_block_map("vm-1", 2, 3).unwrap());

        assert!(target.remove_block("vm-1", &block).unwrap());
        let blocks = dir.path().join("vm-1").join("blocks");
        assert_eq!(fs::read_dir(&blocks).unwrap().count(), 0);
        assert!(!target.remove_block("vm-1", &block).unwrap());
        assert!(target.get_block("vm-1", &block).is_err());
    }

    #[test]
    fn test_truncated_block_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        let block = descriptor(0, b"full payload");
        let path = target.block_path("vm-1", &block).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"full").unwrap();

        assert_eq!(
            target.post_block("vm-1", 0, &block, b"full payload").unwrap(),
            BlockAck::Stored
        );
        assert_eq!(target.get_block("vm-1", &block).unwrap(), b"full payload");
        assert_eq!(
            target.post_block("vm-1", 1, &block, b"full payload").unwrap(),
            BlockAck::Duplicated
        );
    }

    #[test]
    fn test_block_without_digest_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        let bare = BlockDescriptor::builder()
            .index(0)
            .disk_id(0)
            .offset(0)
            .length(1)
            .total_blocks(1)
            .build();
        assert!(target.post_block("vm-1", 0, &bare, b"x").is_err());
    }

    #[test]
    fn test_path_escaping_uuid_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = FileTarget::new(dir.path());
        assert!(target.get_generations_catalog("../etc").is_err());
        assert!(target.profile_exists("..").is_err());
    }
}
