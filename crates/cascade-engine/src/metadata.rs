//! On-device metadata region.
//!
//! The superblock lives at the start of the cache device and carries
//! everything `load` needs to reconstruct the instance: the persisted
//! [`CacheConfig`], core registrations with their sequential-cutoff
//! configuration, and the line mapping table. It ends in a CRC32C over the
//! whole encoding.
//!
//! ```text
//! Superblock:
//! +------------------+---------+
//! | magic            | 4 bytes | = 0x4443_5343 ("CSCD" LE)
//! | version          | 2 bytes | = 2
//! | reserved         | 2 bytes | = 0
//! | cache_mode       | 1 byte  |
//! | cleaning_policy  | 1 byte  |
//! | reserved         | 2 bytes | = 0
//! | cache_line_size  | 4 bytes |
//! | next_core_id     | 4 bytes |
//! | core_count       | 4 bytes |
//! | mapping_count    | 8 bytes |
//! +------------------+---------+
//! | For each core:             |
//! |   core_id        | 4 bytes |
//! |   seq_policy     | 1 byte  |
//! |   reserved       | 3 bytes |
//! |   seq_threshold  | 8 bytes |
//! |   seq_promotion  | 4 bytes |
//! |   uuid_len       | 4 bytes |
//! |   uuid           | N bytes | UTF-8
//! +------------------+---------+
//! | For each mapping:          |
//! |   core_id        | 4 bytes |
//! |   reserved       | 4 bytes |
//! |   core_line      | 8 bytes |
//! |   cache_line     | 8 bytes |
//! |   valid_mask     | 4 bytes |
//! |   dirty_mask     | 4 bytes |
//! +------------------+---------+
//! | crc32c           | 4 bytes | CRC of everything before this field
//! +------------------+---------+
//! ```
//!
//! Any mismatch (magic, version, truncation, field validity, CRC) fails the
//! whole decode with `CorruptSuperblock`; nothing is partially applied.

use crate::linestore::{LineEntry, LineKey};
use cascade_error::{CascadeError, Result};
use cascade_types::{
    CacheConfig, CacheLineSize, CacheMode, CleaningPolicy, CoreId, LineIndex, SeqCutOffConfig,
    SeqCutOffPolicy, SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION,
};

const HEADER_SIZE: usize = 32;
const MAPPING_RECORD_SIZE: usize = 32;

/// Persisted registration of one core device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreMeta {
    pub id: CoreId,
    /// Volume identity resolved through a `VolumeOpener` at load time.
    pub uuid: String,
    pub seq_cutoff: SeqCutOffConfig,
}

/// Decoded metadata region contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub config: CacheConfig,
    pub next_core_id: u32,
    pub cores: Vec<CoreMeta>,
    pub mappings: Vec<(LineKey, LineEntry)>,
}

impl Superblock {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let cores: usize = self
            .cores
            .iter()
            .map(|core| 24 + core.uuid.len())
            .sum();
        HEADER_SIZE + cores + self.mappings.len() * MAPPING_RECORD_SIZE + 4
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf.extend_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        buf.extend_from_slice(&0_u16.to_le_bytes());
        buf.push(self.config.cache_mode.as_u8());
        buf.push(self.config.cleaning_policy.as_u8());
        buf.extend_from_slice(&0_u16.to_le_bytes());
        buf.extend_from_slice(&self.config.cache_line_size.bytes().to_le_bytes());
        buf.extend_from_slice(&self.next_core_id.to_le_bytes());
        buf.extend_from_slice(&u32::try_from(self.cores.len()).unwrap_or(u32::MAX).to_le_bytes());
        buf.extend_from_slice(
            &u64::try_from(self.mappings.len())
                .unwrap_or(u64::MAX)
                .to_le_bytes(),
        );

        for core in &self.cores {
            buf.extend_from_slice(&core.id.0.to_le_bytes());
            buf.push(core.seq_cutoff.policy.as_u8());
            buf.extend_from_slice(&[0_u8; 3]);
            buf.extend_from_slice(&core.seq_cutoff.threshold_bytes.to_le_bytes());
            buf.extend_from_slice(&core.seq_cutoff.promotion_count.to_le_bytes());
            buf.extend_from_slice(
                &u32::try_from(core.uuid.len()).unwrap_or(u32::MAX).to_le_bytes(),
            );
            buf.extend_from_slice(core.uuid.as_bytes());
        }

        for ((core, core_line), entry) in &self.mappings {
            buf.extend_from_slice(&core.0.to_le_bytes());
            buf.extend_from_slice(&0_u32.to_le_bytes());
            buf.extend_from_slice(&core_line.to_le_bytes());
            buf.extend_from_slice(&entry.line.0.to_le_bytes());
            buf.extend_from_slice(&entry.valid.to_le_bytes());
            buf.extend_from_slice(&entry.dirty.to_le_bytes());
        }

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let magic = reader.u32("magic")?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(corrupt(format!(
                "bad magic: expected {SUPERBLOCK_MAGIC:#x}, got {magic:#x}"
            )));
        }
        let version = reader.u16("version")?;
        if version != SUPERBLOCK_VERSION {
            return Err(corrupt(format!(
                "unsupported version: expected {SUPERBLOCK_VERSION}, got {version}"
            )));
        }
        let _reserved = reader.u16("reserved")?;

        let mode = CacheMode::from_u8(reader.u8("cache_mode")?).map_err(config_corrupt)?;
        let cleaning =
            CleaningPolicy::from_u8(reader.u8("cleaning_policy")?).map_err(config_corrupt)?;
        let _reserved = reader.u16("reserved")?;
        let line_size =
            CacheLineSize::new(reader.u32("cache_line_size")?).map_err(config_corrupt)?;
        let next_core_id = reader.u32("next_core_id")?;
        let core_count = reader.u32("core_count")?;
        let mapping_count = reader.u64("mapping_count")?;

        let mut cores = Vec::with_capacity(core_count as usize);
        for _ in 0..core_count {
            let id = CoreId(reader.u32("core_id")?);
            let policy =
                SeqCutOffPolicy::from_u8(reader.u8("seq_policy")?).map_err(config_corrupt)?;
            reader.skip(3, "reserved")?;
            let threshold_bytes = reader.u64("seq_threshold")?;
            let promotion_count = reader.u32("seq_promotion")?;
            let uuid_len = reader.u32("uuid_len")? as usize;
            let uuid_bytes = reader.bytes(uuid_len, "uuid")?;
            let uuid = String::from_utf8(uuid_bytes.to_vec())
                .map_err(|_| corrupt("core uuid is not valid UTF-8".to_owned()))?;

            let seq_cutoff = SeqCutOffConfig {
                policy,
                threshold_bytes,
                promotion_count,
            };
            seq_cutoff.validate().map_err(config_corrupt)?;
            cores.push(CoreMeta {
                id,
                uuid,
                seq_cutoff,
            });
        }

        let mapping_count = usize::try_from(mapping_count)
            .map_err(|_| corrupt("mapping count overflows usize".to_owned()))?;
        let mut mappings = Vec::with_capacity(mapping_count.min(1 << 20));
        for _ in 0..mapping_count {
            let core = CoreId(reader.u32("mapping core_id")?);
            reader.skip(4, "reserved")?;
            let core_line = reader.u64("core_line")?;
            let cache_line = LineIndex(reader.u64("cache_line")?);
            let valid = reader.u32("valid_mask")?;
            let dirty = reader.u32("dirty_mask")?;
            if dirty & !valid != 0 {
                return Err(corrupt(format!(
                    "mapping for core {} line {core_line} marks invalid blocks dirty",
                    core.0
                )));
            }
            mappings.push((
                (core, core_line),
                LineEntry {
                    line: cache_line,
                    valid,
                    dirty,
                },
            ));
        }

        let body_end = reader.position();
        let stored_crc = reader.u32("crc32c")?;
        let computed = crc32c::crc32c(&bytes[..body_end]);
        if stored_crc != computed {
            return Err(corrupt(format!(
                "crc mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
            )));
        }

        Ok(Self {
            config: CacheConfig {
                cache_mode: mode,
                cleaning_policy: cleaning,
                cache_line_size: line_size,
            },
            next_core_id,
            cores,
            mappings,
        })
    }
}

/// Parse only the fixed superblock head far enough to learn the cache line
/// size, which fixes the metadata region geometry for the full decode.
pub fn peek_line_size(bytes: &[u8]) -> Result<CacheLineSize> {
    let mut reader = Reader::new(bytes);
    let magic = reader.u32("magic")?;
    if magic != SUPERBLOCK_MAGIC {
        return Err(corrupt(format!(
            "bad magic: expected {SUPERBLOCK_MAGIC:#x}, got {magic:#x}"
        )));
    }
    let version = reader.u16("version")?;
    if version != SUPERBLOCK_VERSION {
        return Err(corrupt(format!(
            "unsupported version: expected {SUPERBLOCK_VERSION}, got {version}"
        )));
    }
    reader.skip(2, "reserved")?;
    reader.skip(4, "mode/cleaning")?;
    CacheLineSize::new(reader.u32("cache_line_size")?).map_err(config_corrupt)
}

fn corrupt(detail: String) -> CascadeError {
    CascadeError::CorruptSuperblock(detail)
}

fn config_corrupt(err: cascade_types::ConfigError) -> CascadeError {
    CascadeError::CorruptSuperblock(err.to_string())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn bytes(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| corrupt(format!("{field}: length overflow")))?;
        if end > self.bytes.len() {
            return Err(corrupt(format!(
                "{field}: truncated at offset {}, need {len} bytes, have {}",
                self.pos,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize, field: &str) -> Result<()> {
        let _ = self.bytes(len, field)?;
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.bytes(1, field)?[0])
    }

    fn u16(&mut self, field: &str) -> Result<u16> {
        let raw = self.bytes(2, field)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        let raw = self.bytes(4, field)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        let raw = self.bytes(8, field)?;
        let mut out = [0_u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_le_bytes(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            config: CacheConfig {
                cache_mode: CacheMode::WriteBack,
                cleaning_policy: CleaningPolicy::Nop,
                cache_line_size: CacheLineSize::default(),
            },
            next_core_id: 3,
            cores: vec![
                CoreMeta {
                    id: CoreId(1),
                    uuid: "core-a".to_owned(),
                    seq_cutoff: SeqCutOffConfig::default(),
                },
                CoreMeta {
                    id: CoreId(2),
                    uuid: "core-b".to_owned(),
                    seq_cutoff: SeqCutOffConfig {
                        policy: SeqCutOffPolicy::Always,
                        threshold_bytes: 512 * 1024,
                        promotion_count: 1,
                    },
                },
            ],
            mappings: vec![
                (
                    (CoreId(1), 0),
                    LineEntry {
                        line: LineIndex(0),
                        valid: 0b1,
                        dirty: 0b1,
                    },
                ),
                (
                    (CoreId(2), 17),
                    LineEntry {
                        line: LineIndex(5),
                        valid: 0b11,
                        dirty: 0,
                    },
                ),
            ],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let sb = sample();
        let bytes = sb.encode();
        assert_eq!(bytes.len(), sb.encoded_len());
        let decoded = Superblock::decode(&bytes).expect("decode");
        assert_eq!(decoded, sb);
    }

    #[test]
    fn corrupted_byte_fails_crc() {
        let mut bytes = sample().encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let err = Superblock::decode(&bytes).expect_err("corrupt body");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));
    }

    #[test]
    fn bad_magic_is_reported_before_crc() {
        let mut bytes = sample().encode();
        bytes[0] ^= 0xFF;
        let err = Superblock::decode(&bytes).expect_err("bad magic");
        assert!(err.to_string().contains("bad magic"), "got: {err}");
    }

    #[test]
    fn truncated_region_is_corrupt() {
        let bytes = sample().encode();
        let err = Superblock::decode(&bytes[..bytes.len() - 6]).expect_err("truncated");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));
    }

    #[test]
    fn unknown_mode_discriminant_is_corrupt() {
        let mut bytes = sample().encode();
        // cache_mode byte sits at offset 8; restamp the CRC so only the
        // field validation can reject it.
        bytes[8] = 0xEE;
        let body_end = bytes.len() - 4;
        let crc = crc32c::crc32c(&bytes[..body_end]);
        bytes[body_end..].copy_from_slice(&crc.to_le_bytes());

        let err = Superblock::decode(&bytes).expect_err("bad mode");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));
        assert!(err.to_string().contains("cache_mode"), "got: {err}");
    }

    #[test]
    fn peek_reads_line_size_from_the_fixed_head() {
        let bytes = sample().encode();
        let line_size = peek_line_size(&bytes[..16]).expect("peek");
        assert_eq!(line_size, CacheLineSize::default());

        let mut zeroed = vec![0_u8; 64];
        zeroed[0] = 1;
        assert!(peek_line_size(&zeroed).is_err());
    }

    #[test]
    fn dirty_beyond_valid_is_corrupt() {
        let mut sb = sample();
        sb.mappings[1].1.dirty = 0b100;
        let bytes = sb.encode();
        let err = Superblock::decode(&bytes).expect_err("dirty invalid block");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));
    }
}
