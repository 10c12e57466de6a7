use clap::Parser;
use k_safekeep::backup::archive::{ArchiveManager, ArchiveManagerMode};
use k_safekeep::backup::config::SafekeepConfig;
use k_safekeep::backup::generation::catalog::GenerationsCatalog;
use k_safekeep::backup::generation::GenerationId;
use k_safekeep::backup::result_error::result::Result;
use k_safekeep::backup::result_error::WithMsg;
use k_safekeep::backup::target::RepositoryTarget;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};

/// Inspect the generations kept for one entity in a filesystem repository
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    /// Uuid of the protected entity
    #[arg(short, long)]
    entity: String,
    /// Read back and check every block needed to restore this generation
    #[arg(long)]
    verify: Option<GenerationId>,
}

fn run(args: &Args) -> Result<()> {
    let config = SafekeepConfig::from_yaml_file(&args.config)?;
    let target: Arc<dyn RepositoryTarget> = Arc::new(config.build_target());

    let stored = target
        .get_generations_catalog(&args.entity)
        .and_then(|bytes| GenerationsCatalog::from_bytes(&bytes))
        .with_msg(format!("No readable history for {}", args.entity))?;
    let manager = ArchiveManager::open(stored.entity().clone(), target.clone(), ArchiveManagerMode::Read)?;

    let entity = manager.entity();
    info!("{} ({}, {})", entity.name(), entity.uuid(), entity.entity_type());
    for generation in manager.catalog().generations().values() {
        let state = match generation.succeeded() {
            Some(true) => "succeeded",
            Some(false) => "failed",
            None => "pending",
        };
        info!(
            "generation {} {} {} parent={:?} disks={} {}",
            generation.id(),
            generation.timestamp(),
            generation.backup_mode(),
            generation.previous_generation_id(),
            generation.number_of_disks(),
            state
        );
    }

    if let Some(id) = args.verify {
        let chain = manager.restore_chain(id)?;
        let dumper = config.build_dumper(target)?;
        for generation_id in &chain {
            if let Some(generation) = manager.catalog().generation(*generation_id) {
                for disk_id in generation.disks().keys() {
                    let blocks = dumper.verify_disk(entity.uuid(), *generation_id, *disk_id)?;
                    info!("generation {} disk {}: {} blocks ok", generation_id, disk_id, blocks);
                }
            }
        }
        info!("Restore chain {:?} verified", chain);
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("{e}");
        exit(1);
    }
}
