//! Snapshot file format
//!
//! ```text
//! CUBESNAP | version: u32 LE | manifest length: u64 LE | manifest (JSON)
//! | Arrow IPC stream for entry 0 | Arrow IPC stream for entry 1 | ...
//! ```
//!
//! The manifest carries each entry's aggregation request, timestamps, row
//! count and payload length, plus the snapshot time and the invalidation
//! checkpoint. Keys are rebuilt from the requests on load.

use crate::cache::{CacheEntry, CubeCacheStore};
use crate::invalidation::InvalidationCheckpoint;
use arrow::compute::concat_batches;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use cube_core::{unix_millis, CubeError, Result};
use cube_parser::AggregationRequest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"CUBESNAP";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 8;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    taken_at: u64,
    checkpoint: Option<InvalidationCheckpoint>,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    request: AggregationRequest,
    created_at: u64,
    last_access_at: u64,
    row_count: usize,
    payload_len: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub request: AggregationRequest,
    pub table: RecordBatch,
    pub created_at: u64,
    pub last_access_at: u64,
}

/// Point-in-time copy of the store plus the invalidation checkpoint
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub taken_at: u64,
    pub checkpoint: Option<InvalidationCheckpoint>,
    pub entries: Vec<SnapshotEntry>,
}

impl CacheSnapshot {
    pub fn capture(store: &CubeCacheStore, checkpoint: Option<InvalidationCheckpoint>) -> Self {
        let entries = store
            .snapshot()
            .iter()
            .map(|entry| SnapshotEntry {
                request: entry.request.clone(),
                table: entry.table.clone(),
                created_at: entry.created_at,
                last_access_at: entry.last_access_at(),
            })
            .collect();

        Self {
            taken_at: unix_millis(),
            checkpoint,
            entries,
        }
    }

    pub fn into_entries(self) -> Vec<CacheEntry> {
        self.entries
            .into_iter()
            .map(|e| CacheEntry::with_timestamps(e.request, e.table, e.created_at, e.last_access_at))
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payloads = Vec::with_capacity(self.entries.len());
        let mut manifest_entries = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let payload = encode_table(&entry.table)?;
            manifest_entries.push(ManifestEntry {
                request: entry.request.clone(),
                created_at: entry.created_at,
                last_access_at: entry.last_access_at,
                row_count: entry.table.num_rows(),
                payload_len: payload.len() as u64,
            });
            payloads.push(payload);
        }

        let manifest = serde_json::to_vec(&Manifest {
            taken_at: self.taken_at,
            checkpoint: self.checkpoint.clone(),
            entries: manifest_entries,
        })
        .map_err(|e| CubeError::SnapshotWriteFailure(e.to_string()))?;

        let body_len: usize = payloads.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + manifest.len() + body_len);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(manifest.len() as u64).to_le_bytes());
        out.extend_from_slice(&manifest);
        for payload in payloads {
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err(corrupt("missing CUBESNAP header"));
        }

        let version = u32::from_le_bytes(fixed(&bytes[8..12])?);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }

        let manifest_len = u64::from_le_bytes(fixed(&bytes[12..20])?) as usize;
        let manifest_end = HEADER_LEN
            .checked_add(manifest_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupt("manifest length exceeds file size"))?;

        let manifest: Manifest = serde_json::from_slice(&bytes[HEADER_LEN..manifest_end])
            .map_err(|e| corrupt(format!("bad manifest: {}", e)))?;

        let mut offset = manifest_end;
        let mut entries = Vec::with_capacity(manifest.entries.len());
        for meta in manifest.entries {
            let end = offset
                .checked_add(meta.payload_len as usize)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| corrupt("truncated table payload"))?;

            let table = decode_table(&bytes[offset..end])?;
            if table.num_rows() != meta.row_count {
                return Err(corrupt(format!(
                    "row count mismatch: manifest says {}, payload has {}",
                    meta.row_count,
                    table.num_rows()
                )));
            }

            entries.push(SnapshotEntry {
                request: meta.request,
                table,
                created_at: meta.created_at,
                last_access_at: meta.last_access_at,
            });
            offset = end;
        }

        if offset != bytes.len() {
            return Err(corrupt("trailing bytes after last payload"));
        }

        Ok(Self {
            taken_at: manifest.taken_at,
            checkpoint: manifest.checkpoint,
            entries,
        })
    }
}

/// Write a snapshot to `path` through a temporary file and a rename
pub fn write_snapshot(path: &Path, snapshot: &CacheSnapshot) -> Result<()> {
    let bytes = snapshot.encode()?;
    let tmp = tmp_path(path);

    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CubeError::SnapshotWriteFailure(format!("{}: {}", path.display(), e))
    })
}

pub fn read_snapshot(path: &Path) -> Result<CacheSnapshot> {
    let bytes = fs::read(path)
        .map_err(|e| corrupt(format!("cannot read {}: {}", path.display(), e)))?;
    CacheSnapshot::decode(&bytes)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn encode_table(table: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &table.schema())
            .map_err(|e| CubeError::SnapshotWriteFailure(e.to_string()))?;
        writer
            .write(table)
            .map_err(|e| CubeError::SnapshotWriteFailure(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CubeError::SnapshotWriteFailure(e.to_string()))?;
    }
    Ok(buffer)
}

fn decode_table(bytes: &[u8]) -> Result<RecordBatch> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| corrupt(format!("bad table payload: {}", e)))?;
    let schema = reader.schema();

    let mut batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| corrupt(format!("bad table payload: {}", e)))?;

    match batches.len() {
        0 => Ok(RecordBatch::new_empty(schema)),
        1 => Ok(batches.remove(0)),
        _ => concat_batches(&schema, &batches).map_err(|e| corrupt(e.to_string())),
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| corrupt("short header field"))
}

fn corrupt(msg: impl Into<String>) -> CubeError {
    CubeError::SnapshotCorrupt(msg.into())
}
