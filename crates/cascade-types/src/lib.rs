#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Granularity of all block accounting (4 KiB, the exported-object sector
/// grouping used by the statistics output).
pub const BLOCK_4K: u64 = 4096;

/// Offset of the metadata superblock on the cache device, in bytes.
pub const SUPERBLOCK_OFFSET: u64 = 0;

/// Superblock magic ("CSCD" little-endian).
pub const SUPERBLOCK_MAGIC: u32 = 0x4443_5343;

/// Current superblock format version.
pub const SUPERBLOCK_VERSION: u16 = 2;

/// Byte offset on a byte-addressed device (pread/pwrite semantics).
///
/// Unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Identifier of a core device within one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub u32);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Index of a cache line within the cache device's line region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineIndex(pub u64);

/// Write policy of a cache instance.
///
/// Exactly one mode is active at any instant. Switching is atomic with
/// respect to subsequently admitted requests; in-flight requests complete
/// under the mode in effect when they were admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Write to core and cache synchronously.
    WriteThrough,
    /// Write to cache only; dirty data propagates to core later.
    WriteBack,
    /// Write to core only; only reads populate the cache.
    WriteAround,
    /// Write to cache only; reads of non-resident data go to core without
    /// inserting.
    WriteOnly,
    /// Cache bypassed entirely.
    PassThrough,
}

/// Capability flags derived from a [`CacheMode`].
///
/// Purely derived; never stored independently of the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheModeTraits {
    /// Reads populate the cache on miss.
    pub insert_read: bool,
    /// Writes populate the cache.
    pub insert_write: bool,
    /// Writes are buffered dirty in cache before core propagation.
    pub lazy_writes: bool,
}

impl CacheMode {
    pub const ALL: [Self; 5] = [
        Self::WriteThrough,
        Self::WriteBack,
        Self::WriteAround,
        Self::WriteOnly,
        Self::PassThrough,
    ];

    /// Capability set for this mode.
    #[must_use]
    pub fn traits(self) -> CacheModeTraits {
        match self {
            Self::WriteThrough => CacheModeTraits {
                insert_read: true,
                insert_write: true,
                lazy_writes: false,
            },
            Self::WriteBack => CacheModeTraits {
                insert_read: true,
                insert_write: true,
                lazy_writes: true,
            },
            Self::WriteAround => CacheModeTraits {
                insert_read: true,
                insert_write: false,
                lazy_writes: false,
            },
            Self::WriteOnly => CacheModeTraits {
                insert_read: false,
                insert_write: true,
                lazy_writes: true,
            },
            Self::PassThrough => CacheModeTraits {
                insert_read: false,
                insert_write: false,
                lazy_writes: false,
            },
        }
    }

    /// All modes whose capability set satisfies `pred`.
    pub fn with_traits(pred: impl Fn(CacheModeTraits) -> bool) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|mode| pred(mode.traits()))
            .collect()
    }

    /// Two-letter administration name (WT/WB/WA/WO/PT).
    #[must_use]
    pub fn short_name(self) -> &'static str {
        match self {
            Self::WriteThrough => "wt",
            Self::WriteBack => "wb",
            Self::WriteAround => "wa",
            Self::WriteOnly => "wo",
            Self::PassThrough => "pt",
        }
    }

    /// Stable on-disk discriminant.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::WriteThrough => 1,
            Self::WriteBack => 2,
            Self::WriteAround => 3,
            Self::WriteOnly => 4,
            Self::PassThrough => 5,
        }
    }

    /// Decode an on-disk discriminant.
    pub fn from_u8(value: u8) -> Result<Self, ConfigError> {
        match value {
            1 => Ok(Self::WriteThrough),
            2 => Ok(Self::WriteBack),
            3 => Ok(Self::WriteAround),
            4 => Ok(Self::WriteOnly),
            5 => Ok(Self::PassThrough),
            _ => Err(ConfigError::InvalidField {
                field: "cache_mode",
                reason: "unknown discriminant",
            }),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WriteThrough => "Write-Through",
            Self::WriteBack => "Write-Back",
            Self::WriteAround => "Write-Around",
            Self::WriteOnly => "Write-Only",
            Self::PassThrough => "Pass-Through",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wt" | "writethrough" | "write-through" => Ok(Self::WriteThrough),
            "wb" | "writeback" | "write-back" => Ok(Self::WriteBack),
            "wa" | "writearound" | "write-around" => Ok(Self::WriteAround),
            "wo" | "writeonly" | "write-only" => Ok(Self::WriteOnly),
            "pt" | "passthrough" | "pass-through" => Ok(Self::PassThrough),
            _ => Err(ConfigError::InvalidField {
                field: "cache_mode",
                reason: "expected one of wt|wb|wa|wo|pt",
            }),
        }
    }
}

/// Background dirty-data propagation strategy.
///
/// The strategy internals are outside this engine's decision logic; only
/// `Nop` disables the background cleaner entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CleaningPolicy {
    Nop,
    Alru,
    Acp,
}

impl CleaningPolicy {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Nop => 0,
            Self::Alru => 1,
            Self::Acp => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(Self::Nop),
            1 => Ok(Self::Alru),
            2 => Ok(Self::Acp),
            _ => Err(ConfigError::InvalidField {
                field: "cleaning_policy",
                reason: "unknown discriminant",
            }),
        }
    }
}

impl Default for CleaningPolicy {
    fn default() -> Self {
        Self::Alru
    }
}

impl fmt::Display for CleaningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nop => "nop",
            Self::Alru => "alru",
            Self::Acp => "acp",
        };
        f.write_str(name)
    }
}

impl FromStr for CleaningPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nop" => Ok(Self::Nop),
            "alru" => Ok(Self::Alru),
            "acp" => Ok(Self::Acp),
            _ => Err(ConfigError::InvalidField {
                field: "cleaning_policy",
                reason: "expected one of nop|alru|acp",
            }),
        }
    }
}

/// Validated cache line size (power-of-two multiple of 4 KiB, 4..=64 KiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheLineSize(u32);

impl CacheLineSize {
    /// Create a `CacheLineSize` if `bytes` is a power of two in [4 KiB, 64 KiB].
    pub fn new(bytes: u32) -> Result<Self, ConfigError> {
        if !bytes.is_power_of_two() || !(4096..=65536).contains(&bytes) {
            return Err(ConfigError::InvalidField {
                field: "cache_line_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn bytes(self) -> u32 {
        self.0
    }

    /// 4 KiB blocks per line.
    #[must_use]
    pub fn blocks(self) -> u64 {
        u64::from(self.0) / BLOCK_4K
    }
}

impl Default for CacheLineSize {
    fn default() -> Self {
        Self(4096)
    }
}

impl fmt::Display for CacheLineSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} KiB", self.0 / 1024)
    }
}

/// Sequential cutoff engagement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeqCutOffPolicy {
    /// Cutoff active for every over-threshold sequential stream.
    Always,
    /// Cutoff active only while the cache has no free lines.
    Full,
    /// Cutoff disabled.
    Never,
}

impl SeqCutOffPolicy {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Always => 0,
            Self::Full => 1,
            Self::Never => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(Self::Always),
            1 => Ok(Self::Full),
            2 => Ok(Self::Never),
            _ => Err(ConfigError::InvalidField {
                field: "seq_cutoff_policy",
                reason: "unknown discriminant",
            }),
        }
    }
}

impl Default for SeqCutOffPolicy {
    fn default() -> Self {
        Self::Full
    }
}

impl fmt::Display for SeqCutOffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Always => "always",
            Self::Full => "full",
            Self::Never => "never",
        };
        f.write_str(name)
    }
}

impl FromStr for SeqCutOffPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "full" => Ok(Self::Full),
            "never" => Ok(Self::Never),
            _ => Err(ConfigError::InvalidField {
                field: "seq_cutoff_policy",
                reason: "expected one of always|full|never",
            }),
        }
    }
}

/// Per-core sequential cutoff configuration.
///
/// Configuration persists across stop/load; per-stream runtime state does
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqCutOffConfig {
    pub policy: SeqCutOffPolicy,
    /// Accumulated sequential bytes at which a stream is cut off.
    pub threshold_bytes: u64,
    /// Sequential requests required before the cutoff may engage.
    pub promotion_count: u32,
}

impl SeqCutOffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold_bytes == 0 {
            return Err(ConfigError::InvalidField {
                field: "seq_cutoff_threshold",
                reason: "must be greater than zero",
            });
        }
        if self.promotion_count == 0 {
            return Err(ConfigError::InvalidField {
                field: "seq_cutoff_promotion_count",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

impl Default for SeqCutOffConfig {
    fn default() -> Self {
        Self {
            policy: SeqCutOffPolicy::default(),
            threshold_bytes: 1024 * 1024,
            promotion_count: 8,
        }
    }
}

/// Persisted cache instance configuration.
///
/// After a stop followed by a load of the same cache device, the restored
/// value is bit-identical to the configuration in effect right before stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_mode: CacheMode,
    pub cleaning_policy: CleaningPolicy,
    pub cache_line_size: CacheLineSize,
}

impl CacheConfig {
    #[must_use]
    pub fn new(cache_mode: CacheMode) -> Self {
        Self {
            cache_mode,
            cleaning_policy: CleaningPolicy::default(),
            cache_line_size: CacheLineSize::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_writes_modes() {
        let lazy = CacheMode::with_traits(|t| t.lazy_writes);
        assert_eq!(lazy, vec![CacheMode::WriteBack, CacheMode::WriteOnly]);
    }

    #[test]
    fn insert_read_modes() {
        let populating = CacheMode::with_traits(|t| t.insert_read);
        assert_eq!(
            populating,
            vec![
                CacheMode::WriteThrough,
                CacheMode::WriteBack,
                CacheMode::WriteAround
            ]
        );
    }

    #[test]
    fn mode_round_trips_through_discriminant() {
        for mode in CacheMode::ALL {
            assert_eq!(CacheMode::from_u8(mode.as_u8()).unwrap(), mode);
        }
        assert!(CacheMode::from_u8(0).is_err());
        assert!(CacheMode::from_u8(6).is_err());
    }

    #[test]
    fn mode_parses_short_and_long_names() {
        assert_eq!("wt".parse::<CacheMode>().unwrap(), CacheMode::WriteThrough);
        assert_eq!(
            "Write-Only".parse::<CacheMode>().unwrap(),
            CacheMode::WriteOnly
        );
        assert!("wx".parse::<CacheMode>().is_err());
    }

    #[test]
    fn line_size_rejects_bad_values() {
        assert!(CacheLineSize::new(4096).is_ok());
        assert!(CacheLineSize::new(65536).is_ok());
        assert!(CacheLineSize::new(0).is_err());
        assert!(CacheLineSize::new(2048).is_err());
        assert!(CacheLineSize::new(12288).is_err());
        assert!(CacheLineSize::new(131_072).is_err());
    }

    #[test]
    fn seq_cutoff_config_validation() {
        let ok = SeqCutOffConfig::default();
        assert!(ok.validate().is_ok());

        let zero_threshold = SeqCutOffConfig {
            threshold_bytes: 0,
            ..ok
        };
        assert!(zero_threshold.validate().is_err());

        let zero_promotion = SeqCutOffConfig {
            promotion_count: 0,
            ..ok
        };
        assert!(zero_promotion.validate().is_err());
    }
}
