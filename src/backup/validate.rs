//! Validation functions for configuration values.

use validator::ValidationError;

use std::path::Path;

/// Smallest block the pipeline accepts.
pub const MIN_BLOCK_SIZE: u32 = 4096;
/// Largest block the pipeline accepts.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access repository path {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

/// Block sizes are powers of two between 4 KiB and 64 MiB.
pub fn validate_block_size(block_size: impl std::borrow::Borrow<u32>) -> Result<(), ValidationError> {
    let block_size = *block_size.borrow();
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || !block_size.is_power_of_two() {
        return Err(ValidationError::new("InvalidBlockSize").with_message(
            format!(
                "block_size {block_size} must be a power of two in [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]"
            )
            .into(),
        ));
    }

    Ok(())
}
