//! Per-entity session over the generations catalog: opening, backup mode
//! decisions, sealing, dependency queries and deletion.

pub mod mode;

use crate::backup::archive::mode::determine_backup_mode;
use crate::backup::block::BlockDescriptor;
use crate::backup::cancel::CancellationToken;
use crate::backup::function_path;
use crate::backup::generation::catalog::GenerationsCatalog;
use crate::backup::generation::{
    BackupMode, EntityInfo, Generation, GenerationId, GenerationSpec, OperationState,
};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::target::RepositoryTarget;
use chrono::{DateTime, Utc};
use derive_more::Display;
use function_name::named;
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ArchiveManagerMode {
    /// Existing history only, no new generations
    #[display("READ")]
    Read,
    /// Load or create, changes are persisted
    #[display("WRITE")]
    Write,
    /// Scratch catalog, never persisted
    #[display("TEMPORARY")]
    Temporary,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Refuse while any generation depends on the target
    #[default]
    Reject,
    /// Also remove every transitive dependent
    Cascade,
}

#[derive(Debug)]
pub struct ArchiveManager {
    entity: EntityInfo,
    catalog: GenerationsCatalog,
    target: Arc<dyn RepositoryTarget>,
    mode: ArchiveManagerMode,
}

impl ArchiveManager {
    #[named]
    pub fn open(
        entity: EntityInfo,
        target: Arc<dyn RepositoryTarget>,
        mode: ArchiveManagerMode,
    ) -> Result<Self> {
        let catalog = match mode {
            ArchiveManagerMode::Temporary => {
                let catalog = GenerationsCatalog::new(entity.clone());
                target.create_profile_folder(&catalog)?;
                catalog
            }
            ArchiveManagerMode::Read | ArchiveManagerMode::Write => {
                if target.profile_exists(entity.uuid())? {
                    let mut catalog = Self::load_catalog(&entity, target.as_ref())?;
                    catalog.reconcile_entity(&entity)?;
                    catalog
                } else {
                    tracing::info!("No history for {} ({}), starting empty", entity.name(), entity.uuid());
                    let catalog = GenerationsCatalog::new(entity.clone());
                    target.create_profile_folder(&catalog)?;
                    catalog
                }
            }
        };

        let mut manager = Self {
            entity,
            catalog,
            target,
            mode,
        };
        if manager.catalog.is_dirty() {
            manager
                .persist_if_writable()
                .with_debug_object_and_fn_name(manager.entity.clone(), function_path!())?;
        }
        tracing::info!(
            "Opened archive of {} in {} mode on {} ({} generations)",
            manager.entity.uuid(),
            manager.mode,
            manager.target.parent(),
            manager.catalog.num_of_generations()
        );
        Ok(manager)
    }

    fn load_catalog(entity: &EntityInfo, target: &dyn RepositoryTarget) -> Result<GenerationsCatalog> {
        target
            .get_generations_catalog(entity.uuid())
            .and_then(|bytes| GenerationsCatalog::from_bytes(&bytes))
            .map_err(|e| Error::CatalogUnreadable {
                entity_uuid: entity.uuid().clone(),
                error: Box::new(e),
            })
    }

    fn persist_if_writable(&mut self) -> Result<()> {
        if self.mode != ArchiveManagerMode::Write {
            return Ok(());
        }
        if self.catalog.persist(self.target.as_ref())? {
            Ok(())
        } else {
            Err(Error::CatalogRejected {
                entity_uuid: self.entity.uuid().clone(),
                target: self.target.parent().to_string(),
            })
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == ArchiveManagerMode::Read {
            Err(Error::ReadOnlyArchive)
        } else {
            Ok(())
        }
    }

    pub fn entity(&self) -> &EntityInfo {
        &self.entity
    }

    pub fn catalog(&self) -> &GenerationsCatalog {
        &self.catalog
    }

    pub fn mode(&self) -> ArchiveManagerMode {
        self.mode
    }

    pub fn target(&self) -> &Arc<dyn RepositoryTarget> {
        &self.target
    }

    pub fn determine_backup_mode(
        &self,
        generation: &Generation,
        disk_id: u32,
        requested_mode: BackupMode,
    ) -> BackupMode {
        determine_backup_mode(&self.catalog, generation, disk_id, requested_mode)
    }

    /// Decides every disk's mode and derives the generation's: INCREMENTAL
    /// when at least one disk is.
    pub fn resolve_disk_modes(&self, generation: &mut Generation, requested_mode: BackupMode) -> BackupMode {
        let modes = generation
            .disks()
            .keys()
            .map(|disk_id| (*disk_id, self.determine_backup_mode(generation, *disk_id, requested_mode)))
            .collect_vec();
        for (disk_id, mode) in &modes {
            if let Some(disk) = generation.disk_mut(*disk_id) {
                disk.set_backup_mode(Some(*mode));
            }
            tracing::debug!("Generation {} disk {}: {}", generation.id(), disk_id, mode);
        }
        let mode = if modes.iter().any(|(_, m)| *m == BackupMode::Incremental) {
            BackupMode::Incremental
        } else {
            BackupMode::Full
        };
        generation.set_backup_mode(mode);
        mode
    }

    /// Opens a pending generation for `spec`. Its parent candidate is the
    /// latest succeeded generation.
    #[named]
    pub fn prepare_new_generation(
        &mut self,
        spec: GenerationSpec,
        cancel: &CancellationToken,
    ) -> Result<Generation> {
        self.ensure_writable()?;
        cancel.check()?;

        let forced_mode = if spec.requested_mode == BackupMode::Full {
            BackupMode::Full
        } else {
            BackupMode::Unknown
        };
        let id = self
            .catalog
            .create_new_generation_id(spec.timestamp, forced_mode);
        let mut generation = self
            .catalog
            .generation(id)
            .cloned()
            .ok_or(Error::GenerationNotFound(id))?;
        generation.set_change_tracking_enabled(spec.change_tracking_enabled);
        generation.set_disks(spec.disks);
        let mode = self.resolve_disk_modes(&mut generation, spec.requested_mode);
        self.catalog.update_pending_generation(generation.clone())?;
        self.persist_if_writable()
            .with_debug_object_and_fn_name(id, function_path!())?;

        tracing::info!(
            "Generation {} of {} prepared: {} (parent {:?}, {} disks)",
            id,
            self.entity.uuid(),
            mode,
            generation.previous_generation_id(),
            generation.number_of_disks()
        );
        Ok(generation)
    }

    /// Seals `generation` with the outcome of its backup; returns whether it
    /// succeeded.
    #[named]
    pub fn finalize_backup(
        &mut self,
        generation: &Generation,
        operation_state: OperationState,
    ) -> Result<bool> {
        self.ensure_writable()?;
        let succeeded = operation_state == OperationState::Success;
        let mut sealed = generation.clone();
        sealed.set_succeeded(succeeded);
        self.catalog
            .set_generation_info(&sealed, sealed.backup_mode())?;
        self.persist_if_writable()
            .with_debug_object_and_fn_name(generation.id(), function_path!())?;
        if !succeeded {
            tracing::warn!(
                "Generation {} of {} finished {}",
                generation.id(),
                self.entity.uuid(),
                operation_state
            );
        }
        Ok(succeeded)
    }

    /// The generation built directly on `id`, looking only at the next
    /// succeeded generation. Branching histories need
    /// [`ArchiveManager::depending_generation_list`].
    pub fn dependent_generation(&self, id: GenerationId) -> Option<GenerationId> {
        let next = self.catalog.next_succeeded_generation_id(id)?;
        self.catalog
            .generation(next)
            .filter(|g| g.previous_generation_id() == Some(id))
            .map(Generation::id)
    }

    pub fn depending_generation_list(&self, id: GenerationId) -> Vec<GenerationId> {
        self.catalog.depending_generation_list(id)
    }

    pub fn depends_on_generation_id(&self, id: GenerationId) -> Result<Option<GenerationId>> {
        self.catalog.depending_generation_id(id)
    }

    pub fn failed_generation_list(&self) -> Vec<GenerationId> {
        self.catalog.failed_generation_list()
    }

    pub fn generation_id_list(&self) -> Vec<GenerationId> {
        self.catalog.generation_id_list()
    }

    pub fn latest_generation_id(&self) -> Option<GenerationId> {
        self.catalog.latest_generation_id()
    }

    pub fn latest_succeeded_generation_id(&self) -> Option<GenerationId> {
        self.catalog.latest_succeeded_generation_id()
    }

    /// Highest succeeded id among `ids`.
    pub fn latest_succeeded_generation_id_of(&self, ids: &[GenerationId]) -> Option<GenerationId> {
        ids.iter()
            .copied()
            .filter(|id| self.catalog.is_generation_succeeded(*id))
            .max()
    }

    pub fn timestamp_of_latest_generation(&self) -> Option<DateTime<Utc>> {
        self.catalog.latest_generation().map(Generation::timestamp)
    }

    pub fn timestamp_of_latest_succeeded_generation(&self) -> Option<DateTime<Utc>> {
        self.catalog
            .latest_succeeded_generation()
            .map(Generation::timestamp)
    }

    /// Change-tracking id the parent of `generation` recorded for the same
    /// disk, i.e. the baseline to query changed extents from.
    pub fn prev_change_id(&self, generation: &Generation, disk_id: u32) -> Option<&str> {
        let uuid = generation.disk(disk_id)?.uuid();
        self.catalog
            .generation(generation.previous_generation_id()?)?
            .disk_with_uuid(uuid)?
            .valid_change_id()
    }

    pub fn restore_chain(&self, id: GenerationId) -> Result<Vec<GenerationId>> {
        self.catalog.restore_chain(id)
    }

    /// Removes generation `id` according to `policy`; returns the removed ids.
    #[named]
    pub fn remove_generation(&mut self, id: GenerationId, policy: DeletePolicy) -> Result<Vec<GenerationId>> {
        self.ensure_writable()?;
        if !self.catalog.is_generation_exist(id) {
            return Err(Error::GenerationNotFound(id));
        }
        let dependents = self.catalog.depending_generation_list(id);
        let doomed: BTreeSet<GenerationId> = match policy {
            DeletePolicy::Reject if !dependents.is_empty() => {
                return Err(Error::GenerationHasDependents { id, dependents });
            }
            DeletePolicy::Reject => BTreeSet::from([id]),
            DeletePolicy::Cascade => {
                let mut doomed = BTreeSet::from([id]);
                let mut pending = dependents;
                while let Some(next) = pending.pop() {
                    if doomed.insert(next) {
                        pending.extend(self.catalog.depending_generation_list(next));
                    }
                }
                doomed
            }
        };

        let mut removed = Vec::with_capacity(doomed.len());
        for doomed_id in doomed.iter().rev() {
            removed.push(self.catalog.remove_generation(*doomed_id)?);
        }
        self.persist_if_writable()
            .with_debug_object_and_fn_name(id, function_path!())?;
        let purged = self
            .purge_generation_data(&removed)
            .with_debug_object_and_fn_name(id, function_path!())?;
        let removed = doomed.into_iter().collect_vec();
        tracing::info!(
            "Removed generations {:?} of {}, {} payloads purged",
            removed,
            self.entity.uuid(),
            purged
        );
        Ok(removed)
    }

    /// Payload descriptors named by the block maps of `generation`, keyed by
    /// strong digest.
    fn referenced_payloads(
        &self,
        generation: &Generation,
    ) -> Result<HashMap<String, BlockDescriptor>> {
        let mut payloads = HashMap::new();
        for disk_id in generation.disks().keys() {
            let map = self
                .target
                .find_block_map(self.entity.uuid(), generation.id(), *disk_id)?;
            for descriptor in map.iter().flat_map(|map| map.blocks().values()) {
                if let Some(key) = descriptor.strong_hex() {
                    payloads.entry(key).or_insert_with(|| descriptor.clone());
                }
            }
        }
        Ok(payloads)
    }

    /// Deletes the block maps of `removed` and every payload no remaining
    /// generation still names. Returns the number of payloads deleted.
    #[named]
    fn purge_generation_data(&self, removed: &[Generation]) -> Result<usize> {
        let uuid = self.entity.uuid();
        let mut orphans = HashMap::new();
        for generation in removed {
            orphans.extend(
                self.referenced_payloads(generation)
                    .with_debug_object_and_fn_name(generation.id(), function_path!())?,
            );
        }
        for generation in self.catalog.generations().values() {
            if orphans.is_empty() {
                break;
            }
            for key in self
                .referenced_payloads(generation)
                .with_debug_object_and_fn_name(generation.id(), function_path!())?
                .keys()
            {
                orphans.remove(key);
            }
        }

        let mut purged = 0;
        for (key, descriptor) in &orphans {
            if self
                .target
                .remove_block(uuid, descriptor)
                .with_debug_object_and_fn_name(key.clone(), function_path!())?
            {
                purged += 1;
            }
        }
        for generation in removed {
            for disk_id in generation.disks().keys() {
                self.target
                    .remove_block_map(uuid, generation.id(), *disk_id)
                    .with_debug_object_and_fn_name((generation.id(), *disk_id), function_path!())?;
            }
        }
        Ok(purged)
    }

    /// Writes the catalog now. TEMPORARY sessions never write.
    pub fn post_generations_catalog(&mut self) -> Result<bool> {
        match self.mode {
            ArchiveManagerMode::Read => Err(Error::ReadOnlyArchive),
            ArchiveManagerMode::Temporary => Ok(false),
            ArchiveManagerMode::Write => self.catalog.persist(self.target.as_ref()),
        }
    }
}
