//! Reads a disk block by block, transforms each block, and posts it to the
//! repository target on a bounded worker pool.

use crate::backup::block::buffer_pool::BufferPool;
use crate::backup::block::transform::BlockTransformer;
use crate::backup::block::{plan_blocks, BlockDescriptor, BlockMap, Extent};
use crate::backup::cancel::CancellationToken;
use crate::backup::function_path;
use crate::backup::generation::disk::{DiskProfile, DumpStatistics};
use crate::backup::generation::{GenerationId, OperationState};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::target::{BlockAck, RepositoryTarget};
use bon::Builder;
use function_name::named;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Random-access reader over one virtual disk.
pub trait BlockSource: Send + Sync {
    fn capacity(&self) -> u64;

    /// Fills `buf` entirely from `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl BlockSource for Vec<u8> {
    fn capacity(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let bytes = start
            .checked_add(buf.len())
            .and_then(|end| self.get(start..end))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {} past end of disk", buf.len(), offset),
                )
            })?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

/// Flat disk image on the local filesystem. Reads are positional, so every
/// worker reads concurrently through the same handle.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    capacity: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let capacity = file.metadata()?.len();
        Ok(Self { file, capacity })
    }
}

impl BlockSource for FileSource {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.seek_read(&mut buf[filled..], offset + filled as u64)? {
                0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                n => filled += n,
            }
        }
        Ok(())
    }
}

/// One disk of one generation to dump.
#[derive(Builder)]
pub struct DumpJob<'a> {
    #[builder(into)]
    entity_uuid: String,
    generation_id: GenerationId,
    disk_id: u32,
    source: &'a dyn BlockSource,
    /// Only these ranges are read; `None` reads the whole disk
    changed_extents: Option<Vec<Extent>>,
}

impl Debug for DumpJob<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpJob")
            .field("entity_uuid", &self.entity_uuid)
            .field("generation_id", &self.generation_id)
            .field("disk_id", &self.disk_id)
            .field("capacity", &self.source.capacity())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpReport {
    pub block_map: BlockMap,
    pub total_blocks: u32,
    pub state: OperationState,
    pub statistics: DumpStatistics,
}

impl DumpReport {
    /// Records the outcome on the disk's profile in the generation.
    pub fn apply_to(&self, profile: &mut DiskProfile) {
        let stored = self.block_map.blocks().values().filter(|b| !b.is_failed());
        let (compressed, ciphered) = stored.fold((false, false), |(c, e), b| {
            (c || b.flags().compressed, e || b.flags().ciphered)
        });
        profile
            .set_statistics(self.statistics)
            .set_compressed(compressed)
            .set_ciphered(ciphered);
    }
}

pub struct DiskDumper {
    pool: ThreadPool,
    buffers: BufferPool,
    transformer: BlockTransformer,
    target: Arc<dyn RepositoryTarget>,
    block_size: u32,
    max_block_attempts: u32,
    retry_delay: Duration,
}

impl Debug for DiskDumper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskDumper")
            .field("threads", &self.pool.current_num_threads())
            .field("block_size", &self.block_size)
            .field("max_block_attempts", &self.max_block_attempts)
            .field("target", &self.target.parent())
            .finish()
    }
}

impl DiskDumper {
    pub fn new(
        parallelism: usize,
        block_size: u32,
        max_block_attempts: u32,
        retry_delay: Duration,
        transformer: BlockTransformer,
        target: Arc<dyn RepositoryTarget>,
    ) -> Result<Self> {
        let parallelism = parallelism.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("dump-{i}"))
            .build()?;
        Ok(Self {
            pool,
            buffers: BufferPool::new(parallelism, block_size as usize),
            transformer,
            target,
            block_size,
            max_block_attempts: max_block_attempts.max(1),
            retry_delay,
        })
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Dumps every planned block of `job`. Failed blocks do not stop their
    /// siblings; the disk succeeds only with a complete block map.
    #[named]
    pub fn dump(&self, job: &DumpJob<'_>, cancel: &CancellationToken) -> Result<DumpReport> {
        let modified = job.changed_extents.is_some();
        let extents = job.changed_extents.clone().unwrap_or_else(|| {
            vec![Extent {
                offset: 0,
                length: job.source.capacity(),
            }]
        });
        let plan = plan_blocks(&extents, self.block_size);
        let total_blocks = u32::try_from(plan.len()).map_err(io::Error::other)?;
        tracing::info!(
            "Dumping disk {} of {} generation {}: {} blocks",
            job.disk_id,
            job.entity_uuid,
            job.generation_id,
            total_blocks
        );

        let descriptors: Vec<BlockDescriptor> = self.pool.install(|| {
            plan.par_iter()
                .enumerate()
                .filter_map(|(index, (offset, length))| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let descriptor = BlockDescriptor::builder()
                        .index(index as u32)
                        .disk_id(job.disk_id)
                        .offset(*offset)
                        .length(*length)
                        .total_blocks(total_blocks)
                        .build();
                    Some(self.dump_block(job, descriptor, modified, cancel))
                })
                .collect()
        });

        let mut block_map = BlockMap::new(job.disk_id);
        descriptors.into_iter().for_each(|d| {
            block_map.insert(d);
        });

        let state = if block_map.is_complete(total_blocks) {
            OperationState::Success
        } else if cancel.is_cancelled() {
            OperationState::Aborted
        } else {
            OperationState::Failed
        };
        let statistics = block_map.statistics();
        self.target
            .post_block_map(&job.entity_uuid, job.generation_id, &block_map)
            .with_debug_object_and_fn_name(format!("{job:?}"), function_path!())?;

        tracing::info!(
            "Disk {} of {} generation {}: {} ({} blocks, {} raw bytes, {} stored bytes, {} duplicated)",
            job.disk_id,
            job.entity_uuid,
            job.generation_id,
            state,
            statistics.blocks,
            statistics.raw_bytes,
            statistics.stored_bytes,
            statistics.duplicated_blocks
        );
        Ok(DumpReport {
            block_map,
            total_blocks,
            state,
            statistics,
        })
    }

    fn dump_block(
        &self,
        job: &DumpJob<'_>,
        mut descriptor: BlockDescriptor,
        modified: bool,
        cancel: &CancellationToken,
    ) -> BlockDescriptor {
        loop {
            descriptor.begin_attempt();
            let error = match self.try_block(job, &mut descriptor, modified) {
                Ok(()) => {
                    descriptor.mark_finished();
                    return descriptor;
                }
                Err(e) => e,
            };

            let attempt = descriptor.attempts();
            tracing::warn!(
                "Block {} of disk {} attempt {}/{} failed: {}",
                descriptor.index(),
                job.disk_id,
                attempt,
                self.max_block_attempts,
                error
            );
            if attempt >= self.max_block_attempts || cancel.is_cancelled() {
                descriptor.mark_failed(error.to_string());
                return descriptor;
            }
            if !self.retry_delay.is_zero() {
                std::thread::sleep(self.retry_delay);
            }
        }
    }

    fn try_block(
        &self,
        job: &DumpJob<'_>,
        descriptor: &mut BlockDescriptor,
        modified: bool,
    ) -> Result<()> {
        let mut slot = self.buffers.lease();
        job.source.read_at(
            descriptor.offset(),
            slot.input_mut(descriptor.length() as usize),
        )?;

        let outcome = self.transformer.process(&mut slot)?;
        let mut flags = outcome.flags;
        flags.modified = modified;
        descriptor.record_transform(outcome.digest, outcome.stored_size as u32, flags);

        let ack = self.target.post_block(
            &job.entity_uuid,
            job.generation_id,
            descriptor,
            slot.region(outcome.staged),
        )?;
        descriptor.mark_duplicated(ack == BlockAck::Duplicated);
        tracing::debug!(
            "Block {} of disk {}: {} -> {} bytes ({:?}, slot {})",
            descriptor.index(),
            job.disk_id,
            descriptor.length(),
            outcome.stored_size,
            ack,
            slot.id()
        );
        Ok(())
    }

    /// Reads back every stored block of a dumped disk and checks it decodes
    /// to the recorded length with matching digests.
    pub fn verify_disk(
        &self,
        entity_uuid: &str,
        generation_id: GenerationId,
        disk_id: u32,
    ) -> Result<u32> {
        let block_map = self.target.get_block_map(entity_uuid, generation_id, disk_id)?;
        let stored: Vec<&BlockDescriptor> =
            block_map.blocks().values().filter(|b| !b.is_failed()).collect();

        let errors: Vec<Error> = self.pool.install(|| {
            stored
                .par_iter()
                .filter_map(|descriptor| {
                    let mut slot = self.buffers.lease();
                    self.target
                        .get_block(entity_uuid, descriptor)
                        .and_then(|payload| self.transformer.decode(descriptor, &payload, &mut slot))
                        .err()
                })
                .collect()
        });
        convert_error_vec(errors)?;
        tracing::info!(
            "Verified {} blocks of disk {} of {} generation {}",
            stored.len(),
            disk_id,
            entity_uuid,
            generation_id
        );
        Ok(stored.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::xz::XzConfig;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::encrypt::BlockCipher;
    use crate::backup::target::memory::MemoryTarget;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BLOCK: u32 = 4096;

    fn dumper(target: Arc<MemoryTarget>, parallelism: usize, attempts: u32) -> DiskDumper {
        DiskDumper::new(
            parallelism,
            BLOCK,
            attempts,
            Duration::ZERO,
            BlockTransformer::new(
                CompressorConfig::Xz(XzConfig::default()),
                Arc::new(BlockCipher::None),
            ),
            target,
        )
        .unwrap()
    }

    fn disk(blocks: usize) -> Vec<u8> {
        (0..blocks * BLOCK as usize)
            .map(|i| ((i / BLOCK as usize) * 31 + i % 7) as u8)
            .collect()
    }

    fn job(source: &dyn BlockSource) -> DumpJob<'_> {
        DumpJob::builder()
            .entity_uuid("vm-1")
            .generation_id(0)
            .disk_id(0)
            .source(source)
            .build()
    }

    #[test]
    fn test_full_dump_is_complete_and_verifiable() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 4, 3);
        let source = disk(9);
        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();

        assert_eq!(report.state, OperationState::Success);
        assert_eq!(report.total_blocks, 9);
        assert!(report.block_map.is_complete(9));
        assert_eq!(report.statistics.raw_bytes, 9 * BLOCK as u64);
        assert!(report
            .block_map
            .blocks()
            .values()
            .all(|b| b.flags().compressed && !b.flags().modified));
        assert_eq!(target.get_block_map("vm-1", 0, 0).unwrap(), report.block_map);
        assert_eq!(dumper.verify_disk("vm-1", 0, 0).unwrap(), 9);
        assert_eq!(dumper.buffers().available(), 4);

        let mut profile = DiskProfile::builder().disk_id(0).uuid("d0").build();
        report.apply_to(&mut profile);
        assert!(profile.compressed());
        assert!(!profile.ciphered());
        assert_eq!(profile.statistics().blocks, 9);
    }

    #[test]
    fn test_identical_blocks_are_stored_once() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 3, 1);
        let source = vec![0u8; 6 * BLOCK as usize];
        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();

        assert_eq!(report.state, OperationState::Success);
        assert_eq!(target.stored_block_count(), 1);
        assert_eq!(report.statistics.duplicated_blocks, 5);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 1, 3);
        target.fail_next_block_posts(2);
        let source = disk(2);
        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();

        assert_eq!(report.state, OperationState::Success);
        let attempts: u32 = report.block_map.blocks().values().map(|b| b.attempts()).sum();
        assert_eq!(attempts, 4);
    }

    #[test]
    fn test_exhausted_block_fails_disk_but_siblings_are_kept() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 1, 2);
        target.fail_next_block_posts(2);
        let source = disk(3);
        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();

        assert_eq!(report.state, OperationState::Failed);
        assert_eq!(report.block_map.len(), 3);
        let failed: Vec<_> = report.block_map.failed_blocks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts(), 2);
        assert!(failed[0].failure().as_deref().unwrap().contains("injected"));
        assert_eq!(report.statistics.blocks, 2);
        assert_eq!(dumper.buffers().available(), 1);
        assert_eq!(dumper.verify_disk("vm-1", 0, 0).unwrap(), 2);
    }

    #[test]
    fn test_cancelled_dump_is_aborted() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 2, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = disk(4);
        let report = dumper.dump(&job(&source), &cancel).unwrap();

        assert_eq!(report.state, OperationState::Aborted);
        assert!(report.block_map.is_empty());
        assert_eq!(target.stored_block_count(), 0);
    }

    /// Disk image that requests cancellation while the block at `offset` is
    /// being read.
    struct CancelAtOffset {
        image: Vec<u8>,
        offset: u64,
        cancel: CancellationToken,
    }

    impl BlockSource for CancelAtOffset {
        fn capacity(&self) -> u64 {
            self.image.len() as u64
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            if offset == self.offset {
                self.cancel.cancel();
            }
            BlockSource::read_at(&self.image, offset, buf)
        }
    }

    #[test]
    fn test_cancel_mid_dump_keeps_in_flight_block() {
        let target = Arc::new(MemoryTarget::new());
        // one worker walks the blocks in order
        let dumper = dumper(target.clone(), 1, 3);
        let cancel = CancellationToken::new();
        let source = CancelAtOffset {
            image: disk(6),
            offset: 2 * BLOCK as u64,
            cancel: cancel.clone(),
        };
        let report = dumper.dump(&job(&source), &cancel).unwrap();

        assert_eq!(report.state, OperationState::Aborted);
        assert_eq!(report.block_map.blocks().keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        let in_flight = report.block_map.get(2).unwrap();
        assert!(!in_flight.is_failed());
        assert_eq!(in_flight.attempts(), 1);
        assert_eq!(in_flight.length(), BLOCK);
        assert!((3..6).all(|index| report.block_map.get(index).is_none()));
        assert_eq!(target.stored_block_count(), 3);
        assert_eq!(target.get_block_map("vm-1", 0, 0).unwrap(), report.block_map);
        assert_eq!(dumper.verify_disk("vm-1", 0, 0).unwrap(), 3);
    }

    #[test]
    fn test_changed_extents_limit_the_dump() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 2, 1);
        let source = disk(8);
        let job = DumpJob::builder()
            .entity_uuid("vm-1")
            .generation_id(1)
            .disk_id(0)
            .source(&source)
            .changed_extents(vec![
                Extent { offset: 0, length: BLOCK as u64 },
                Extent { offset: 5 * BLOCK as u64, length: 2 * BLOCK as u64 },
            ])
            .build();
        let report = dumper.dump(&job, &CancellationToken::new()).unwrap();

        assert_eq!(report.state, OperationState::Success);
        assert_eq!(report.total_blocks, 3);
        let offsets: Vec<u64> = report.block_map.blocks().values().map(|b| b.offset()).collect();
        assert_eq!(offsets, vec![0, 5 * BLOCK as u64, 6 * BLOCK as u64]);
        assert!(report.block_map.blocks().values().all(|b| b.flags().modified));
    }

    #[test]
    fn test_verify_detects_corrupted_payload() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 2, 1);
        let source = disk(2);
        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();
        let victim = report.block_map.get(1).unwrap();
        target.corrupt_block("vm-1", victim).unwrap();

        let error = dumper.verify_disk("vm-1", 0, 0).unwrap_err();
        assert!(error
            .into_iter()
            .any(|e| matches!(e, Error::DigestMismatch { index: 1, .. })));
    }

    #[test]
    fn test_file_source_reads_image() {
        let mut image = NamedTempFile::new().unwrap();
        image.write_all(&disk(3)).unwrap();
        let source = FileSource::open(image.path()).unwrap();
        assert_eq!(source.capacity(), 3 * BLOCK as u64);

        let mut buf = vec![0u8; 16];
        source.read_at(BLOCK as u64, &mut buf).unwrap();
        assert_eq!(buf, disk(3)[BLOCK as usize..BLOCK as usize + 16]);
        assert!(source.read_at(3 * BLOCK as u64 - 8, &mut buf).is_err());
    }

    #[test]
    fn test_file_source_serves_concurrent_workers() {
        let mut image = NamedTempFile::new().unwrap();
        image.write_all(&disk(8)).unwrap();
        let source = FileSource::open(image.path()).unwrap();
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 4, 1);

        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();
        assert_eq!(report.state, OperationState::Success);
        assert_eq!(target.stored_block_count(), 8);
        assert_eq!(dumper.verify_disk("vm-1", 0, 0).unwrap(), 8);
    }

    #[test]
    fn test_short_tail_block_is_dumped() {
        let target = Arc::new(MemoryTarget::new());
        let dumper = dumper(target.clone(), 2, 1);
        let mut source = disk(2);
        source.truncate(BLOCK as usize + 100);
        let report = dumper.dump(&job(&source), &CancellationToken::new()).unwrap();
        assert_eq!(report.total_blocks, 2);
        assert_eq!(report.block_map.get(1).unwrap().length(), 100);
        assert_eq!(dumper.verify_disk("vm-1", 0, 0).unwrap(), 2);
    }
}
