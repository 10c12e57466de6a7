use std::io::Error;

/// Flushes trailing stream state (footers, checksums) and hands back the sink.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}
