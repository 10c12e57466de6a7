pub mod archive;
pub mod block;
pub mod cancel;
pub mod compress;
pub mod config;
pub mod encrypt;
pub mod finish;
pub mod generation;
pub mod redacted;
pub mod result_error;
pub mod target;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
