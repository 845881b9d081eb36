use thiserror::Error;

/// Recoverable failures surfaced by the cache.
///
/// Corruption and caller-misuse conditions (magic sentinel mismatch, hash
/// miss on a freed pointer, destroying a cache with outstanding
/// allocations) are not represented here — they panic via [`crate::invariant`]
/// because they are not locally recoverable.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of memory growing cache '{cache}'")]
    OutOfMemory { cache: String },

    #[error("sleeping allocation requested from a context the platform reports as unsafe to sleep in")]
    ContextViolation,

    #[error("invalid object size {size} for cache '{cache}'")]
    InvalidSize { cache: String, size: usize },
}

pub type Result<T> = std::result::Result<T, CacheError>;
