use crate::backup::generation::BackupMode;
use bon::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Change-tracking id the hypervisor reports when no baseline exists.
pub const UNKNOWN_CHANGE_ID: &str = "*";

/// Where the disk sits on the virtual hardware.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerPlacement {
    pub controller_key: i32,
    pub bus_number: i32,
    pub unit_number: i32,
}

/// Totals recorded once a disk dump completes.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpStatistics {
    pub blocks: u32,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
    pub duplicated_blocks: u32,
}

/// Per-disk snapshot captured when a generation is opened.
#[skip_serializing_none]
#[derive(
    Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters, CopyGetters, Setters,
)]
pub struct DiskProfile {
    #[getset(get_copy = "pub")]
    disk_id: u32,
    #[builder(into)]
    #[getset(get = "pub")]
    uuid: String,
    /// Bytes; absent or negative when the hypervisor could not report it
    #[getset(get_copy = "pub")]
    capacity: Option<i64>,
    #[builder(into)]
    #[getset(get = "pub")]
    change_id: Option<String>,
    #[getset(get_copy = "pub")]
    placement: Option<ControllerPlacement>,
    #[getset(get_copy = "pub", set = "pub")]
    backup_mode: Option<BackupMode>,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub", set = "pub")]
    compressed: bool,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub", set = "pub")]
    ciphered: bool,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub", set = "pub")]
    statistics: DumpStatistics,
}

impl DiskProfile {
    /// Change-tracking id, or `None` when absent or the `"*"` sentinel.
    pub fn valid_change_id(&self) -> Option<&str> {
        self.change_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != UNKNOWN_CHANGE_ID)
    }

    /// Capacity, or `None` when absent or negative.
    pub fn valid_capacity(&self) -> Option<i64> {
        self.capacity.filter(|c| *c >= 0)
    }
}
