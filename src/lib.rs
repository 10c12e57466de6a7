//! # k-safekeep
//!
//! Generation bookkeeping and block processing for incremental disk backups.
//!
//! ## Features
//!
//! - **Generations catalog**: per-entity history of backup attempts with
//!   FULL/INCREMENTAL dependency chains
//! - **Backup mode decisions**: change-tracking aware choice per disk
//! - **Block pipeline**: bounded buffer pool, XZ compression, AES-256-GCM
//!   encryption, xxh3 + SHA-256 digests
//! - **Repository targets**: content-addressed filesystem store and an
//!   in-memory store
//! - **Parallel Processing**: rayon workers with per-block retries
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_safekeep::backup::archive::{ArchiveManager, ArchiveManagerMode};
//! use k_safekeep::backup::config::SafekeepConfig;
//! use k_safekeep::backup::generation::{EntityInfo, EntityType};
//! use std::sync::Arc;
//!
//! let config = SafekeepConfig::from_yaml_file("config.yml")?;
//! let entity = EntityInfo::builder()
//!     .uuid("50123456-0000-0000-0000-00000000beef")
//!     .name("vm-01")
//!     .server_uuid("vcenter-1")
//!     .entity_type(EntityType::VirtualMachine)
//!     .build();
//! let manager = ArchiveManager::open(entity, Arc::new(config.build_target()), ArchiveManagerMode::Read)?;
//! println!("{:?}", manager.generation_id_list());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
