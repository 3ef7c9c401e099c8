#![forbid(unsafe_code)]
//! Error types for Cascade.
//!
//! # Error Taxonomy
//!
//! Cascade uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Configuration | `ConfigError` | `cascade-types` | Invalid enumerated values and parameter ranges detected at validation time |
//! | Runtime | `CascadeError` (this crate) | `cascade-error` | User-facing errors for the engine, CLI, and API consumers |
//!
//! `ConfigError` converts into `CascadeError::Config` at the engine boundary,
//! except where a more specific variant applies:
//!
//! | Condition | Variant | Recovery |
//! |-----------|---------|----------|
//! | Unrecognized target mode in `set_cache_mode` | `InvalidModeTransition` | Caller retries with a valid mode |
//! | Admin operation racing stop/remove-core | `DeviceBusy` | Caller retries after the conflicting operation completes |
//! | Bad seq-cutoff threshold / promotion count | `InvalidConfiguration` | Caller fixes the parameter |
//! | Metadata checksum/magic/version mismatch at load | `CorruptSuperblock` | Fatal: operator must force-start (recreate) the cache |
//!
//! `CorruptSuperblock` is fatal to the `load` call and never partially
//! applies configuration.

use cascade_types::ConfigError;
use thiserror::Error;

/// Unified error type for all Cascade operations.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `set_cache_mode` target is not a recognized mode.
    #[error("invalid mode transition: {0}")]
    InvalidModeTransition(String),

    /// An administrative operation raced a stop/remove-core on the same
    /// cache instance. Admin operations serialize; contended attempts fail
    /// fast instead of queueing.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Degenerate classifier or engine parameter (zero threshold, zero
    /// promotion count).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The stored metadata region failed its magic/version/checksum check.
    ///
    /// Fatal to `load`; the operator must recreate the cache with a forced
    /// start rather than load it.
    #[error("corrupt superblock: {0}")]
    CorruptSuperblock(String),

    /// Request or metadata range falls outside the device.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The cache device cannot hold the metadata region plus at least one
    /// cache line.
    #[error("insufficient cache capacity: {0}")]
    NoCapacity(String),

    /// Named core (or cache) object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A non-forced start found existing cache metadata on the device.
    #[error("existing cache metadata found: {0}")]
    MetadataExists(String),

    /// Structural config validation failure surfaced from `cascade-types`.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl CascadeError {
    /// Whether the error is unrecoverable for the current cache device
    /// contents (the operator must force-start).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptSuperblock(_))
    }
}

/// Result alias using `CascadeError`.
pub type Result<T> = std::result::Result<T, CascadeError>;
