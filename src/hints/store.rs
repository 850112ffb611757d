//! Durable per-target hint log
//!
//! Append-only log with one record per hint event. A `put` record
//! carries the target name and the opaque write payload; an `ack`
//! record marks a hint as replayed. Replay on open folds both into an
//! in-memory per-target index, so deletion never rewrites the file and
//! a crash between append and ack simply replays the hint again.

use crate::coordination::{keys, CoordinationStore};
use crate::{Error, Result};
use crc32fast::Hasher;
use std::collections::BTreeMap;
use std::fs::File as StdFile;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

const MAGIC: &[u8; 4] = b"FGHL";
const VERSION: u8 = 1;
const KIND_PUT: u8 = 1;
const KIND_ACK: u8 = 2;
// magic + version + kind + id + target len + payload len + crc
const HEADER_LEN: usize = 4 + 1 + 1 + 8 + 2 + 4 + 4;
const LOG_FILE: &str = "hints.log";

/// A buffered write awaiting delivery to its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub id: u64,
    pub target: String,
    pub payload: Vec<u8>,
}

/// Durable hint store for one originating node
///
/// A successful [`put`](Self::put) is fsynced before returning and
/// survives a crash. Hints to one target replay in insertion order;
/// ordering across targets is not defined.
pub struct HintStore {
    path: PathBuf,
    file: tokio::fs::File,
    next_id: u64,
    by_target: BTreeMap<String, Vec<Hint>>,
    originator: String,
    /// Coordination store for hint markers, so targets can see that
    /// data is being held for them. Optional for tests.
    markers: Option<Arc<dyn CoordinationStore>>,
}

impl HintStore {
    /// Open or create the hint log in `dir`, replaying any existing
    /// records and reconciling markers for hints that are still live.
    pub async fn open(
        dir: &Path,
        originator: &str,
        markers: Option<Arc<dyn CoordinationStore>>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(LOG_FILE);

        let mut by_target: BTreeMap<String, Vec<Hint>> = BTreeMap::new();
        let mut next_id = 1;
        if path.exists() {
            for record in read_records(&path)? {
                next_id = next_id.max(record.id + 1);
                match record.kind {
                    KIND_PUT => by_target.entry(record.target.clone()).or_default().push(Hint {
                        id: record.id,
                        target: record.target,
                        payload: record.payload,
                    }),
                    KIND_ACK => {
                        if let Some(hints) = by_target.get_mut(&record.target) {
                            hints.retain(|hint| hint.id != record.id);
                        }
                    }
                    other => warn!(kind = other, "skipping unknown hint record kind"),
                }
            }
            by_target.retain(|_, hints| !hints.is_empty());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let store = Self {
            path,
            file,
            next_id,
            by_target,
            originator: originator.to_string(),
            markers,
        };

        // Crash between a local append and its marker write leaves the
        // marker missing; re-put markers for everything still live.
        if let Some(markers) = &store.markers {
            for hints in store.by_target.values() {
                for hint in hints {
                    markers
                        .put(
                            &marker_key(&hint.target, hint.id),
                            store.originator.as_bytes().to_vec(),
                        )
                        .await?;
                }
            }
        }

        Ok(store)
    }

    /// Record a hint. Durable on the local log before the marker is
    /// published and before this returns.
    pub async fn put(&mut self, target: &str, payload: &[u8]) -> Result<u64> {
        if target.is_empty() || target.len() > u16::MAX as usize {
            return Err(Error::Internal(format!(
                "invalid hint target name length {}",
                target.len()
            )));
        }
        let id = self.next_id;
        self.next_id += 1;

        let record = encode_record(KIND_PUT, id, target, payload);
        self.file.write_all(&record).await?;
        self.file.sync_data().await?;

        self.by_target.entry(target.to_string()).or_default().push(Hint {
            id,
            target: target.to_string(),
            payload: payload.to_vec(),
        });

        if let Some(markers) = &self.markers {
            markers
                .put(&marker_key(target, id), self.originator.as_bytes().to_vec())
                .await?;
        }
        Ok(id)
    }

    /// Hints for one target, in insertion order.
    pub fn get_by_target(&self, target: &str) -> Vec<Hint> {
        self.by_target.get(target).cloned().unwrap_or_default()
    }

    /// Targets that currently have pending hints.
    pub fn targets(&self) -> Vec<String> {
        self.by_target.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }

    /// Acknowledge a replayed hint: append an ack record and drop the
    /// marker. A crash before the ack lands only means the hint is
    /// replayed again.
    pub async fn delete(&mut self, target: &str, id: u64) -> Result<()> {
        let record = encode_record(KIND_ACK, id, target, &[]);
        self.file.write_all(&record).await?;
        self.file.sync_data().await?;

        if let Some(hints) = self.by_target.get_mut(target) {
            hints.retain(|hint| hint.id != id);
            if hints.is_empty() {
                self.by_target.remove(target);
            }
        }
        if let Some(markers) = &self.markers {
            markers.delete(&marker_key(target, id)).await?;
        }
        Ok(())
    }

    /// Path of the underlying log file.
    pub fn log_path(&self) -> &Path {
        &self.path
    }
}

fn marker_key(target: &str, id: u64) -> String {
    format!("{}{}/{}", keys::HINTS, target, id)
}

struct RawRecord {
    kind: u8,
    id: u64,
    target: String,
    payload: Vec<u8>,
}

fn encode_record(kind: u8, id: u64, target: &str, payload: &[u8]) -> Vec<u8> {
    let target_bytes = target.as_bytes();
    let mut record = Vec::with_capacity(HEADER_LEN + target_bytes.len() + payload.len());
    record.extend_from_slice(MAGIC);
    record.push(VERSION);
    record.push(kind);
    record.extend_from_slice(&id.to_le_bytes());
    record.extend_from_slice(&(target_bytes.len() as u16).to_le_bytes());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let mut hasher = Hasher::new();
    hasher.update(target_bytes);
    hasher.update(payload);
    record.extend_from_slice(&hasher.finalize().to_le_bytes());
    record.extend_from_slice(target_bytes);
    record.extend_from_slice(payload);
    record
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u64, usize, usize, u32)> {
    if &header[0..4] != MAGIC {
        return Err(Error::Serialization("invalid hint log magic".to_string()));
    }
    if header[4] != VERSION {
        return Err(Error::Serialization(
            "unsupported hint log version".to_string(),
        ));
    }
    let kind = header[5];
    let id = u64::from_le_bytes(header[6..14].try_into().unwrap());
    let target_len = u16::from_le_bytes(header[14..16].try_into().unwrap()) as usize;
    let payload_len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[20..24].try_into().unwrap());
    Ok((kind, id, target_len, payload_len, crc))
}

fn read_records(path: &Path) -> Result<Vec<RawRecord>> {
    let file = StdFile::open(path)?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_exact_or_eof(&mut reader, &mut header) {
            Ok(false) => break, // Clean EOF
            Ok(true) => {}
            Err(_) => {
                // Truncated header = crash point; keep what we have.
                warn!(
                    "truncated hint log header in {:?} after {} records",
                    path,
                    records.len()
                );
                break;
            }
        }
        let (kind, id, target_len, payload_len, expected_crc) = match decode_header(&header) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    "corrupt hint log header in {:?} after {} records - stopping recovery",
                    path,
                    records.len()
                );
                break;
            }
        };
        let mut body = vec![0u8; target_len + payload_len];
        match read_exact_or_eof(&mut reader, &mut body) {
            Ok(true) => {}
            _ => {
                warn!("truncated hint record (id={}) in {:?} - discarding", id, path);
                break;
            }
        }
        let mut hasher = Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != expected_crc {
            warn!("hint log crc mismatch (id={}) in {:?} - discarding tail", id, path);
            break;
        }
        let target = match std::str::from_utf8(&body[..target_len]) {
            Ok(target) => target.to_string(),
            Err(_) => {
                warn!("hint record (id={}) has non-utf8 target - discarding tail", id);
                break;
            }
        };
        records.push(RawRecord {
            kind,
            id,
            target,
            payload: body[target_len..].to_vec(),
        });
    }
    Ok(records)
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<bool> {
    let mut offset = 0;
    while offset < buffer.len() {
        let read = reader.read(&mut buffer[offset..])?;
        if read == 0 {
            if offset == 0 {
                return Ok(false);
            }
            return Err(Error::Serialization("truncated hint record".to_string()));
        }
        offset += read;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = HintStore::open(dir.path(), "origin", None).await.unwrap();
            store.put("node-b", b"cpu,host=a value=1").await.unwrap();
            store.put("node-b", b"cpu,host=a value=2").await.unwrap();
            store.put("node-c", b"mem value=3").await.unwrap();
        }
        // Same as a crash: nothing flushed beyond what put fsynced.
        let store = HintStore::open(dir.path(), "origin", None).await.unwrap();
        let hints = store.get_by_target("node-b");
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].payload, b"cpu,host=a value=1");
        assert_eq!(hints[1].payload, b"cpu,host=a value=2");
        assert_eq!(store.get_by_target("node-c").len(), 1);
    }

    #[tokio::test]
    async fn test_per_target_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut store = HintStore::open(dir.path(), "origin", None).await.unwrap();
        for i in 0..10u32 {
            store.put("node-b", &i.to_le_bytes()).await.unwrap();
        }
        let hints = store.get_by_target("node-b");
        let order: Vec<u32> = hints
            .iter()
            .map(|hint| u32::from_le_bytes(hint.payload.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_delete_is_durable() {
        let dir = TempDir::new().unwrap();
        let id = {
            let mut store = HintStore::open(dir.path(), "origin", None).await.unwrap();
            let id = store.put("node-b", b"one").await.unwrap();
            store.put("node-b", b"two").await.unwrap();
            store.delete("node-b", id).await.unwrap();
            id
        };
        let store = HintStore::open(dir.path(), "origin", None).await.unwrap();
        let hints = store.get_by_target("node-b");
        assert_eq!(hints.len(), 1);
        assert!(hints.iter().all(|hint| hint.id != id));
        assert_eq!(hints[0].payload, b"two");
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut store = HintStore::open(dir.path(), "origin", None).await.unwrap();
            store.put("node-b", b"good").await.unwrap();
            store.put("node-b", b"bad-tail").await.unwrap();
            store.log_path().to_path_buf()
        };

        // Flip a byte in the last record's payload.
        let mut file = StdFile::options().read(true).write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        file.write_all(&byte).unwrap();
        file.sync_all().unwrap();

        let store = HintStore::open(dir.path(), "origin", None).await.unwrap();
        let hints = store.get_by_target("node-b");
        assert_eq!(hints.len(), 1, "corrupt trailing record should be dropped");
        assert_eq!(hints[0].payload, b"good");
    }

    #[tokio::test]
    async fn test_markers_follow_hint_lifecycle() {
        let dir = TempDir::new().unwrap();
        let coordinator: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        let mut store = HintStore::open(dir.path(), "origin", Some(Arc::clone(&coordinator)))
            .await
            .unwrap();

        let id = store.put("node-b", b"payload").await.unwrap();
        let markers = coordinator.list("/hints/node-b/").await.unwrap();
        assert_eq!(markers.kvs.len(), 1);
        assert_eq!(markers.kvs[0].value, b"origin");

        store.delete("node-b", id).await.unwrap();
        let markers = coordinator.list("/hints/node-b/").await.unwrap();
        assert!(markers.kvs.is_empty());
    }
}
