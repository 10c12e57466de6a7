use crate::backup::generation::catalog::GenerationsCatalog;
use crate::backup::generation::{BackupMode, Generation};

/// Chooses FULL or INCREMENTAL for one disk of a pending generation.
///
/// INCREMENTAL needs a succeeded parent holding the same disk (matched by
/// uuid, at the same disk id), equal known capacities, and a usable
/// change-tracking id on both sides. Anything else falls back to FULL.
pub fn determine_backup_mode(
    catalog: &GenerationsCatalog,
    generation: &Generation,
    disk_id: u32,
    requested_mode: BackupMode,
) -> BackupMode {
    if !generation.change_tracking_enabled() {
        tracing::warn!(
            "Change tracking disabled for generation {}, disk {} falls back to FULL",
            generation.id(),
            disk_id
        );
        return BackupMode::Full;
    }
    if requested_mode == BackupMode::Full {
        return BackupMode::Full;
    }

    let Some(previous) = generation
        .previous_generation_id()
        .and_then(|id| catalog.generation(id))
        .filter(|g| g.is_succeeded())
    else {
        return BackupMode::Full;
    };
    let Some(current_disk) = generation.disk(disk_id) else {
        return BackupMode::Full;
    };
    let Some(previous_disk) = previous.disk_with_uuid(current_disk.uuid()) else {
        tracing::debug!(
            "Disk {} ({}) not in generation {}",
            disk_id,
            current_disk.uuid(),
            previous.id()
        );
        return BackupMode::Full;
    };
    if previous_disk.disk_id() != disk_id {
        tracing::warn!(
            "Disk {} was disk {} in generation {}, using FULL",
            disk_id,
            previous_disk.disk_id(),
            previous.id()
        );
        return BackupMode::Full;
    }

    let same_capacity = matches!(
        (current_disk.valid_capacity(), previous_disk.valid_capacity()),
        (Some(current), Some(previous)) if current == previous
    );
    if same_capacity
        && current_disk.valid_change_id().is_some()
        && previous_disk.valid_change_id().is_some()
    {
        BackupMode::Incremental
    } else {
        BackupMode::Full
    }
}
