//! Backup generations and the identity of the entity they protect.

pub mod catalog;
pub mod disk;

use crate::backup::generation::disk::DiskProfile;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

pub type GenerationId = u32;

#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupMode {
    #[display("FULL")]
    Full,
    #[display("INCREMENTAL")]
    Incremental,
    #[default]
    #[display("UNKNOWN")]
    Unknown,
}

/// Outcome reported by whoever drove the backup of a generation.
#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    #[display("SUCCESS")]
    Success,
    #[display("FAILED")]
    Failed,
    #[display("ABORTED")]
    Aborted,
    #[display("SKIPPED")]
    Skipped,
}

#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    VirtualMachine,
    ImprovedVirtualDisk,
    VirtualApp,
}

/// Identity of a protected entity as the hypervisor reports it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters)]
#[getset(get = "pub")]
pub struct EntityInfo {
    #[builder(into)]
    uuid: String,
    #[builder(into)]
    name: String,
    #[builder(into)]
    server_uuid: String,
    entity_type: EntityType,
}

impl EntityInfo {
    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_server_uuid(&mut self, server_uuid: impl Into<String>) {
        self.server_uuid = server_uuid.into();
    }
}

/// One point-in-time backup attempt of one entity.
///
/// `succeeded` is `None` while the generation is pending and is fixed once the
/// catalog seals it.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Getters, CopyGetters)]
pub struct Generation {
    #[getset(get_copy = "pub")]
    id: GenerationId,
    #[getset(get_copy = "pub")]
    timestamp: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    backup_mode: BackupMode,
    #[getset(get_copy = "pub")]
    succeeded: Option<bool>,
    #[getset(get_copy = "pub")]
    previous_generation_id: Option<GenerationId>,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    change_tracking_enabled: bool,
    #[serde(default)]
    #[getset(get = "pub")]
    disks: BTreeMap<u32, DiskProfile>,
}

impl Generation {
    pub(crate) fn pending(
        id: GenerationId,
        timestamp: DateTime<Utc>,
        backup_mode: BackupMode,
        previous_generation_id: Option<GenerationId>,
    ) -> Self {
        Self {
            id,
            timestamp,
            backup_mode,
            succeeded: None,
            previous_generation_id,
            change_tracking_enabled: false,
            disks: BTreeMap::new(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.succeeded == Some(true)
    }

    pub fn is_sealed(&self) -> bool {
        self.succeeded.is_some()
    }

    pub fn disk(&self, disk_id: u32) -> Option<&DiskProfile> {
        self.disks.get(&disk_id)
    }

    pub fn disk_mut(&mut self, disk_id: u32) -> Option<&mut DiskProfile> {
        self.disks.get_mut(&disk_id)
    }

    /// Disks can be renumbered between generations; the uuid is stable.
    pub fn disk_with_uuid(&self, uuid: &str) -> Option<&DiskProfile> {
        self.disks.values().find(|d| d.uuid() == uuid)
    }

    pub fn number_of_disks(&self) -> usize {
        self.disks.len()
    }

    pub(crate) fn set_change_tracking_enabled(&mut self, enabled: bool) {
        self.change_tracking_enabled = enabled;
    }

    pub(crate) fn set_disks(&mut self, disks: impl IntoIterator<Item = DiskProfile>) {
        self.disks = disks.into_iter().map(|d| (d.disk_id(), d)).collect();
    }

    pub(crate) fn set_backup_mode(&mut self, mode: BackupMode) {
        self.backup_mode = mode;
        if mode == BackupMode::Full {
            self.previous_generation_id = None;
        }
    }

    pub(crate) fn set_succeeded(&mut self, succeeded: bool) {
        self.succeeded = Some(succeeded);
    }
}

/// What the orchestrator knows about the entity when it asks for a new generation.
#[derive(Clone, Debug, Builder)]
pub struct GenerationSpec {
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    #[builder(default)]
    pub requested_mode: BackupMode,
    #[builder(default = true)]
    pub change_tracking_enabled: bool,
    #[builder(default)]
    pub disks: Vec<DiskProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_mode_serialization() {
        assert_eq!(serde_json::to_string(&BackupMode::Full).unwrap(), "\"FULL\"");
        assert_eq!(
            serde_json::from_str::<BackupMode>("\"INCREMENTAL\"").unwrap(),
            BackupMode::Incremental
        );
        assert_eq!(BackupMode::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_full_mode_clears_parent() {
        let mut generation = Generation::pending(3, Utc::now(), BackupMode::Unknown, Some(2));
        generation.set_backup_mode(BackupMode::Incremental);
        assert_eq!(generation.previous_generation_id(), Some(2));
        generation.set_backup_mode(BackupMode::Full);
        assert_eq!(generation.previous_generation_id(), None);
    }

    #[test]
    fn test_disk_with_uuid_survives_renumbering() {
        let mut generation = Generation::pending(0, Utc::now(), BackupMode::Full, None);
        generation.set_disks([
            DiskProfile::builder().disk_id(0).uuid("a").build(),
            DiskProfile::builder().disk_id(1).uuid("b").build(),
        ]);
        assert_eq!(generation.disk_with_uuid("b").map(|d| d.disk_id()), Some(1));
        assert!(generation.disk_with_uuid("c").is_none());
        assert_eq!(generation.number_of_disks(), 2);
    }

    #[test]
    fn test_pending_generation_is_not_sealed() {
        let mut generation = Generation::pending(0, Utc::now(), BackupMode::Full, None);
        assert!(!generation.is_sealed());
        assert!(!generation.is_succeeded());
        generation.set_succeeded(false);
        assert!(generation.is_sealed());
        assert!(!generation.is_succeeded());
    }
}
