use crate::backup::block::dump::DiskDumper;
use crate::backup::block::transform::BlockTransformer;
use crate::backup::compress::CompressorConfig;
use crate::backup::encrypt::{CipherBuilder, EncryptorConfig};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::target::file::FileTarget;
use crate::backup::target::RepositoryTarget;
use crate::backup::validate::{validate_block_size, validate_dir_exist_or_created};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

static DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;
static DEFAULT_MAX_BLOCK_RETRIES: u32 = 5;
static DEFAULT_RETRY_DELAY_MS: u64 = 1000;

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .min(256)
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_max_block_retries() -> u32 {
    DEFAULT_MAX_BLOCK_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

/// Block processing settings shared by every disk dump of the process.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Worker threads, also the number of buffer slots
    #[validate(range(min = 1, max = 256))]
    #[serde(default = "default_parallelism")]
    #[builder(default = default_parallelism())]
    pub parallelism: usize,

    #[validate(custom(function = validate_block_size))]
    #[serde(default = "default_block_size")]
    #[builder(default = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Attempts per block, the first one included
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_block_retries")]
    #[builder(default = DEFAULT_MAX_BLOCK_RETRIES)]
    pub max_block_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    #[builder(default = DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    pub compressor: CompressorConfig,

    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    pub encryptor: EncryptorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SafekeepConfig {
    /// Root of the filesystem repository, created when missing
    #[validate(custom(function = validate_dir_exist_or_created))]
    pub repository_dir: Arc<Path>,
    #[validate(nested)]
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl SafekeepConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .and_then(|f| {
                serde_yml::from_reader::<_, SafekeepConfig>(f)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {:?}", path))
            })
            .and_then(|config| {
                config
                    .validate()
                    .map_err(Error::from)
                    .map(|_| config)
                    .with_msg(format!("Config validation failed: {:?}", path))
            })
    }

    pub fn build_target(&self) -> FileTarget {
        FileTarget::new(self.repository_dir.clone())
    }

    pub fn build_dumper(&self, target: Arc<dyn RepositoryTarget>) -> Result<DiskDumper> {
        let pipeline = &self.pipeline;
        let cipher = pipeline.encryptor.build_cipher()?;
        DiskDumper::new(
            pipeline.parallelism,
            pipeline.block_size,
            pipeline.max_block_retries,
            Duration::from_millis(pipeline.retry_delay_ms),
            BlockTransformer::new(pipeline.compressor.clone(), Arc::new(cipher)),
            target,
        )
    }
}
