use crate::backup::generation::GenerationId;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    #[error("Cipher failure: {0}")]
    Cipher(String),
    #[error("Catalog uuid != entity uuid: {catalog_uuid} != {entity_uuid}")]
    IdentityMismatch {
        catalog_uuid: String,
        entity_uuid: String,
    },
    #[error("Generations catalog of {entity_uuid} is inaccessible:\n{}", indent::indent_all_with("  ", error.to_string()))]
    CatalogUnreadable {
        entity_uuid: String,
        error: Box<Error>,
    },
    #[error("Generation {0} doesn't exist")]
    GenerationNotFound(GenerationId),
    #[error("Generation {0} is already sealed")]
    GenerationAlreadySealed(GenerationId),
    #[error("Generation {id} has depending generations {dependents:?}")]
    GenerationHasDependents {
        id: GenerationId,
        dependents: Vec<GenerationId>,
    },
    #[error("Generation {id} has a broken dependency chain at {missing}")]
    BrokenChain {
        id: GenerationId,
        missing: GenerationId,
    },
    #[error("Generation {generation_id} has no block map for disk {disk_id}")]
    BlockMapNotFound {
        generation_id: GenerationId,
        disk_id: u32,
    },
    #[error("Catalog document is inconsistent: {0}")]
    InconsistentCatalog(String),
    #[error("Invalid entity uuid {0:?}")]
    InvalidEntityUuid(String),
    #[error("Block {index} of disk {disk_id} decoded to {actual} bytes, expected {expected}")]
    LengthMismatch {
        disk_id: u32,
        index: u32,
        expected: usize,
        actual: usize,
    },
    #[error("Block {index} of disk {disk_id} has no digest")]
    MissingDigest { disk_id: u32, index: u32 },
    #[error("Target {target} refused the catalog of {entity_uuid}")]
    CatalogRejected { entity_uuid: String, target: String },
    #[error("Archive opened read only")]
    ReadOnlyArchive,
    #[error("Operation aborted")]
    Aborted,
    #[error("Region {region} overflow: {needed} bytes needed, capacity {capacity}")]
    RegionOverflow {
        region: &'static str,
        needed: usize,
        capacity: usize,
    },
    #[error("Block {index} of disk {disk_id} digest mismatch")]
    DigestMismatch { disk_id: u32, index: u32 },
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<aes_gcm::Error> for Error {
    fn from(value: aes_gcm::Error) -> Self {
        Self::Cipher(value.to_string())
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Strips context wrappers and returns the innermost error.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } => error.root(),
            Error::WithDebugObjAndFnName { error, .. } => error.root(),
            e => e,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), Error::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_with_msg() {
        let error = Error::GenerationNotFound(3);
        let error_with_msg = error.with_msg("Custom message");

        match error_with_msg {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
    }

    #[test]
    fn test_error_with_debug_object_and_fn_name() {
        let error = Error::Aborted;
        let error_with_debug = error.with_debug_object_and_fn_name("entity-1", "test_function");

        match &error_with_debug {
            Error::WithDebugObjAndFnName { fn_name, .. } => assert_eq!(fn_name, "test_function"),
            _ => panic!("Expected WithDebugObjAndFnName error"),
        }
        assert!(error_with_debug.is_aborted());
    }

    #[test]
    fn test_error_root_unwraps_context() {
        let error = Error::GenerationNotFound(7)
            .with_msg("outer")
            .with_debug_object_and_fn_name(1, "f");
        assert!(matches!(error.root(), Error::GenerationNotFound(7)));
    }

    #[test]
    fn test_error_from_vec() {
        let errors = vec![Error::Aborted, Error::GenerationNotFound(1)];

        let combined_error = Error::from(errors);
        match combined_error {
            Error::LotsOfError(error_vec) => assert_eq!(error_vec.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    #[should_panic(expected = "Should not create lots of errors when error is empty")]
    fn test_error_from_empty_vec_panics() {
        let errors: Vec<Error> = vec![];
        let _error = Error::from(errors);
    }

    #[test]
    fn test_error_chain_flattens() {
        let chained = Error::Aborted
            .chain(Error::ReadOnlyArchive)
            .chain(Error::GenerationNotFound(2));
        match chained {
            Error::LotsOfError(errors) => assert_eq!(errors.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_identity_mismatch_display() {
        let error = Error::IdentityMismatch {
            catalog_uuid: "aaa".into(),
            entity_uuid: "bbb".into(),
        };
        let error_str = error.to_string();
        assert!(error_str.contains("aaa"));
        assert!(error_str.contains("bbb"));
    }

    #[test]
    fn test_catalog_unreadable_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::CatalogUnreadable {
            entity_uuid: "vm-1".into(),
            error: Box::new(io_error.into()),
        };
        let error_str = error.to_string();
        assert!(error_str.contains("vm-1"));
        assert!(error_str.contains("  file not found"));
    }
}
