//! Per-market chunk index.
//!
//! Each market directory holds a `metadata` file recording when each chunk
//! starts, the current chunk number and how many messages it holds. The file
//! is a small framed record:
//!
//! ```text
//! magic "OBSM" | version: u16 LE | len: u32 LE | crc32: u32 LE | bincode payload
//! ```
//!
//! Every mutation is written to `metadata.tmp` and renamed into place before
//! the in-memory copy changes, so the file always holds a complete record.
use crate::error::{Result, StoreError};
use crate::record::MetadataRecord;
use crc32fast::Hasher as Crc32;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::debug;

pub const METADATA_FILE: &str = "metadata";
pub const METADATA_MAGIC: [u8; 4] = *b"OBSM";
pub const METADATA_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4;

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    path: PathBuf,
    /// Index i is the leading snapshot timestamp of chunk i+1.
    chunk_start_timestamps: Vec<OffsetDateTime>,
    /// 1-indexed; 0 means no chunk exists yet.
    last_chunk_number: u32,
    messages_in_last_chunk: u32,
    sync: bool,
}

impl ChunkMetadata {
    /// Load the metadata at `path`, or create and persist an empty one.
    pub fn load_or_create(path: PathBuf, sync: bool) -> Result<Self> {
        if path.exists() {
            let mut meta = Self::load(&path)?;
            meta.sync = sync;
            return Ok(meta);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let meta = Self {
            path,
            chunk_start_timestamps: Vec::new(),
            last_chunk_number: 0,
            messages_in_last_chunk: 0,
            sync,
        };
        meta.save()?;
        Ok(meta)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let record = decode_frame(&bytes)?;
        if record.last_chunk_number as usize != record.chunk_start_unix_ns.len() {
            return Err(StoreError::Corrupt(format!(
                "{}: last chunk {} but {} chunk start times",
                path.display(),
                record.last_chunk_number,
                record.chunk_start_unix_ns.len()
            )));
        }
        let chunk_start_timestamps = record
            .chunk_start_unix_ns
            .iter()
            .map(|ns| {
                OffsetDateTime::from_unix_timestamp_nanos(*ns)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            path: path.to_path_buf(),
            chunk_start_timestamps,
            last_chunk_number: record.last_chunk_number,
            messages_in_last_chunk: record.messages_in_last_chunk,
            sync: false,
        })
    }

    pub fn save(&self) -> Result<()> {
        let bytes = encode_frame(&self.to_record())?;
        let tmp = self.path.with_file_name(format!("{METADATA_FILE}.tmp"));
        let mut f = File::create(&tmp)?;
        f.write_all(&bytes)?;
        if self.sync {
            f.sync_all()?;
        }
        drop(f);
        fs::rename(&tmp, &self.path)?;
        debug!(
            path = %self.path.display(),
            chunk = self.last_chunk_number,
            messages = self.messages_in_last_chunk,
            "metadata persisted"
        );
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then adopt it.
    fn commit(&mut self, change: impl FnOnce(&mut Self)) -> Result<()> {
        let mut next = self.clone();
        change(&mut next);
        next.save()?;
        *self = next;
        Ok(())
    }

    /// One more message was appended to the last chunk.
    pub fn record_write(&mut self) -> Result<()> {
        self.commit(|m| m.messages_in_last_chunk += 1)
    }

    /// A new chunk starting at `chunk_start` was created.
    pub fn record_rotation(&mut self, chunk_start: OffsetDateTime) -> Result<()> {
        self.commit(|m| {
            m.chunk_start_timestamps.push(chunk_start);
            m.last_chunk_number += 1;
            m.messages_in_last_chunk = 0;
        })
    }

    /// Chunk holding `ts`: the last one starting at or before it, or the
    /// first chunk if `ts` is earlier than all of them or unset.
    pub fn locate_chunk_for(&self, ts: Option<OffsetDateTime>) -> Option<u32> {
        if self.last_chunk_number == 0 {
            return None;
        }
        let Some(ts) = ts else { return Some(1) };
        let after = self.chunk_start_timestamps.partition_point(|start| *start <= ts);
        Some(after.max(1) as u32)
    }

    /// Start timestamp of a 1-indexed chunk.
    pub fn chunk_start(&self, chunk: u32) -> Option<OffsetDateTime> {
        let idx = chunk.checked_sub(1)?;
        self.chunk_start_timestamps.get(idx as usize).copied()
    }

    pub fn chunk_start_timestamps(&self) -> &[OffsetDateTime] {
        &self.chunk_start_timestamps
    }

    pub fn last_chunk_number(&self) -> u32 {
        self.last_chunk_number
    }

    pub fn messages_in_last_chunk(&self) -> u32 {
        self.messages_in_last_chunk
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn to_record(&self) -> MetadataRecord {
        MetadataRecord {
            chunk_start_unix_ns: self
                .chunk_start_timestamps
                .iter()
                .map(|ts| ts.unix_timestamp_nanos())
                .collect(),
            last_chunk_number: self.last_chunk_number,
            messages_in_last_chunk: self.messages_in_last_chunk,
        }
    }
}

fn encode_frame(record: &MetadataRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&METADATA_MAGIC);
    out.extend_from_slice(&METADATA_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_frame(bytes: &[u8]) -> Result<MetadataRecord> {
    if bytes.len() < HEADER_LEN {
        return Err(StoreError::Corrupt(format!(
            "metadata file is {} bytes, shorter than its header",
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[0..4]);
    if magic != METADATA_MAGIC {
        return Err(StoreError::InvalidMagic(magic));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != METADATA_VERSION {
        return Err(StoreError::UnsupportedMetadataVersion(version));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let expected = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);
    if payload.len() != len {
        return Err(StoreError::Corrupt(format!(
            "metadata payload is {} bytes, header says {len}",
            payload.len()
        )));
    }
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(StoreError::MetadataChecksum { expected, actual });
    }
    Ok(bincode::deserialize(payload)?)
}
