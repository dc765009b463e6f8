//! File aggregation: receive `file_info` / `file_chunk` / `file_end` sequences from nodes,
//! write them under the session directory and verify the byte count.
//!
//! One open file per node; different nodes may transfer concurrently. Bytes land in a
//! hidden `.part` file that is renamed over the final name when the transfer closes, so a
//! resend never truncates a copy that was already committed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::identity::is_valid_device_id;
use crate::integrity::StreamDigest;
use crate::protocol::{FileReceived, TransferStatus};
use crate::session::{FileRecord, FileStatus};

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("invalid device id {0:?}")]
    InvalidDeviceId(String),
    #[error("{device_id} already has {name} open")]
    TransferInProgress { device_id: String, name: String },
    #[error("no open transfer for {0}")]
    NoOpenTransfer(String),
    #[error("file_end for {got} but {expected} is open")]
    NameMismatch { expected: String, got: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Finished (or abandoned) transfer: the manifest entry plus the reply for the node.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub record: FileRecord,
    pub reply: FileReceived,
    /// The transfer fell short and an earlier complete copy was kept instead; the record
    /// must not replace the committed one.
    pub discarded: bool,
}

/// Result of appending one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Bytes received so far.
    Written(u64),
    /// The write failed; the transfer was closed as incomplete.
    Failed(Completed),
}

struct ActiveFile {
    name: String,
    declared_size: u64,
    /// Relative to the session directory.
    relative: PathBuf,
    path: PathBuf,
    part: PathBuf,
    /// A complete copy is already committed under this name.
    keep_existing: bool,
    file: File,
    digest: StreamDigest,
    last_activity: i64,
}

/// Strip any path components from a node-supplied name. `None` if nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned.to_string())
}

pub struct FileAggregator {
    chunk_timeout_ms: i64,
    active: HashMap<String, ActiveFile>,
}

impl FileAggregator {
    pub fn new(chunk_timeout_ms: i64) -> Self {
        Self {
            chunk_timeout_ms,
            active: HashMap::new(),
        }
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.active.contains_key(device_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start receiving `<session_dir>/<device_id>/<name>`. `committed` is the session's
    /// manifest so far.
    pub fn on_file_info(
        &mut self,
        session_dir: &Path,
        device_id: &str,
        name: &str,
        size: u64,
        committed: &[FileRecord],
        now: i64,
    ) -> Result<(), AggregationError> {
        if let Some(open) = self.active.get(device_id) {
            return Err(AggregationError::TransferInProgress {
                device_id: device_id.to_string(),
                name: open.name.clone(),
            });
        }
        let name =
            sanitize_file_name(name).ok_or_else(|| AggregationError::InvalidName(name.into()))?;
        if !is_valid_device_id(device_id) {
            return Err(AggregationError::InvalidDeviceId(device_id.into()));
        }
        let relative = PathBuf::from(device_id).join(&name);
        let dir = session_dir.join(device_id);
        fs::create_dir_all(&dir).map_err(|source| AggregationError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = session_dir.join(&relative);
        let part = dir.join(format!(".{name}.part"));
        let file = File::create(&part).map_err(|source| AggregationError::Io {
            path: part.clone(),
            source,
        })?;
        let keep_existing = committed.iter().any(|r| {
            r.device_id == device_id && r.name == name && r.status == FileStatus::Complete
        });
        debug!(device_id, file = %name, size, keep_existing, "file transfer opened");
        self.active.insert(
            device_id.to_string(),
            ActiveFile {
                name,
                declared_size: size,
                relative,
                path,
                part,
                keep_existing,
                file,
                digest: StreamDigest::new(),
                last_activity: now,
            },
        );
        Ok(())
    }

    /// Append a chunk to the node's open file. A failed write closes the transfer so the
    /// recorded size never counts bytes of a partial write.
    pub fn on_file_chunk(
        &mut self,
        device_id: &str,
        data: &[u8],
        now: i64,
    ) -> Result<ChunkOutcome, AggregationError> {
        let open = self
            .active
            .get_mut(device_id)
            .ok_or_else(|| AggregationError::NoOpenTransfer(device_id.to_string()))?;
        match open.file.write_all(data) {
            Ok(()) => {
                open.digest.update(data);
                open.last_activity = now;
                Ok(ChunkOutcome::Written(open.digest.len()))
            }
            Err(e) => {
                warn!(device_id, path = %open.part.display(), error = %e, "file write failed");
                let open = self
                    .active
                    .remove(device_id)
                    .ok_or_else(|| AggregationError::NoOpenTransfer(device_id.to_string()))?;
                if let Err(e) = open.file.set_len(open.digest.len()) {
                    debug!(device_id, error = %e, "could not trim partial write");
                }
                Ok(ChunkOutcome::Failed(close(device_id, open, now, true)))
            }
        }
    }

    /// Close the node's file and compare received bytes with the declared size.
    pub fn on_file_end(
        &mut self,
        device_id: &str,
        name: &str,
        now: i64,
    ) -> Result<Completed, AggregationError> {
        let open = self
            .active
            .get(device_id)
            .ok_or_else(|| AggregationError::NoOpenTransfer(device_id.to_string()))?;
        let got = sanitize_file_name(name).unwrap_or_default();
        if got != open.name {
            return Err(AggregationError::NameMismatch {
                expected: open.name.clone(),
                got,
            });
        }
        let open = self
            .active
            .remove(device_id)
            .ok_or_else(|| AggregationError::NoOpenTransfer(device_id.to_string()))?;
        Ok(close(device_id, open, now, false))
    }

    /// Close transfers with no chunk for longer than the chunk timeout, as incomplete.
    pub fn expire(&mut self, now: i64) -> Vec<Completed> {
        let mut stale: Vec<String> = self
            .active
            .iter()
            .filter(|(_, f)| now.saturating_sub(f.last_activity) > self.chunk_timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale
            .into_iter()
            .filter_map(|id| {
                let open = self.active.remove(&id)?;
                warn!(device_id = %id, file = %open.name, "file transfer timed out");
                Some(close(&id, open, now, true))
            })
            .collect()
    }

    /// The node disconnected mid-transfer.
    pub fn abandon(&mut self, device_id: &str, now: i64) -> Option<Completed> {
        let open = self.active.remove(device_id)?;
        warn!(device_id, file = %open.name, "file transfer abandoned");
        Some(close(device_id, open, now, true))
    }

    /// Close everything, e.g. when the session is aborted.
    pub fn abandon_all(&mut self, now: i64) -> Vec<Completed> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.abandon(&id, now))
            .collect()
    }
}

/// Flush to disk, move the data to its final name and build the manifest entry. The
/// recorded size is what was written.
fn close(device_id: &str, open: ActiveFile, now: i64, cut_short: bool) -> Completed {
    let mut synced = true;
    if let Err(e) = open.file.sync_all() {
        warn!(device_id, path = %open.part.display(), error = %e, "file sync failed");
        synced = false;
    }
    drop(open.file);
    let received = open.digest.len();
    let mut complete = !cut_short && synced && received == open.declared_size;
    let discarded = !complete && open.keep_existing;
    if discarded {
        if let Err(e) = fs::remove_file(&open.part) {
            debug!(device_id, path = %open.part.display(), error = %e, "could not remove partial file");
        }
        warn!(device_id, file = %open.name, received, "partial resend dropped, committed copy kept");
    } else if let Err(e) = fs::rename(&open.part, &open.path) {
        warn!(device_id, path = %open.path.display(), error = %e, "file rename failed");
        complete = false;
    }
    if !complete {
        warn!(
            device_id,
            file = %open.name,
            declared = open.declared_size,
            received,
            "file transfer incomplete"
        );
    }
    let status = if complete {
        FileStatus::Complete
    } else {
        FileStatus::Incomplete
    };
    Completed {
        reply: FileReceived {
            status: if complete {
                TransferStatus::Ok
            } else {
                TransferStatus::Error
            },
            name: open.name.clone(),
            received,
        },
        discarded,
        record: FileRecord {
            device_id: device_id.to_string(),
            name: open.name,
            path: open.relative,
            size_bytes: received,
            declared_size: open.declared_size,
            checksum: open.digest.finish(),
            status,
            committed_at: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use tempfile::TempDir;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn sanitize_strips_paths() {
        assert_eq!(sanitize_file_name("video.mp4").as_deref(), Some("video.mp4"));
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_file_name("C:\\data\\gsr.csv").as_deref(),
            Some("gsr.csv")
        );
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(""), None);
    }

    #[test]
    fn byte_fidelity_for_every_chunk_size() {
        let data = payload(97);
        let expected_checksum = hex::encode(hash_bytes(&data));
        for chunk in 1..=data.len() {
            let dir = TempDir::new().unwrap();
            let mut agg = FileAggregator::new(30_000);
            agg.on_file_info(dir.path(), "phone-1", "gsr.csv", data.len() as u64, &[], 0)
                .unwrap();
            for piece in data.chunks(chunk) {
                agg.on_file_chunk("phone-1", piece, 1).unwrap();
            }
            let done = agg.on_file_end("phone-1", "gsr.csv", 2).unwrap();
            assert_eq!(done.reply.status, TransferStatus::Ok);
            assert_eq!(done.record.status, FileStatus::Complete);
            assert_eq!(done.record.size_bytes, data.len() as u64);
            assert_eq!(done.record.checksum, expected_checksum);
            let written = fs::read(dir.path().join("phone-1").join("gsr.csv")).unwrap();
            assert_eq!(written, data, "chunk size {chunk}");
        }
    }

    #[test]
    fn short_transfer_is_kept_and_flagged() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "thermal-1", "frames.raw", 1000, &[], 0)
            .unwrap();
        agg.on_file_chunk("thermal-1", &payload(950), 1).unwrap();
        let done = agg.on_file_end("thermal-1", "frames.raw", 2).unwrap();
        assert_eq!(done.reply.status, TransferStatus::Error);
        assert_eq!(done.reply.received, 950);
        assert_eq!(done.record.status, FileStatus::Incomplete);
        assert_eq!(done.record.size_bytes, 950);
        assert_eq!(done.record.declared_size, 1000);
        let on_disk = fs::metadata(dir.path().join("thermal-1/frames.raw")).unwrap();
        assert_eq!(on_disk.len(), 950);
    }

    #[test]
    fn chunk_without_transfer_rejected() {
        let mut agg = FileAggregator::new(30_000);
        assert!(matches!(
            agg.on_file_chunk("phone-1", b"abc", 0),
            Err(AggregationError::NoOpenTransfer(_))
        ));
    }

    #[test]
    fn one_file_at_a_time_per_node() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.mp4", 3, &[], 0).unwrap();
        assert!(matches!(
            agg.on_file_info(dir.path(), "phone-1", "b.mp4", 3, &[], 0),
            Err(AggregationError::TransferInProgress { .. })
        ));
        agg.on_file_info(dir.path(), "phone-2", "a.mp4", 3, &[], 0).unwrap();
        assert_eq!(agg.active_count(), 2);
    }

    #[test]
    fn mismatched_end_keeps_transfer_open() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.mp4", 3, &[], 0).unwrap();
        assert!(matches!(
            agg.on_file_end("phone-1", "b.mp4", 1),
            Err(AggregationError::NameMismatch { .. })
        ));
        assert!(agg.is_active("phone-1"));
    }

    #[test]
    fn idle_transfer_expires_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.mp4", 10, &[], 0).unwrap();
        agg.on_file_chunk("phone-1", b"01234", 1_000).unwrap();
        assert!(agg.expire(31_000).is_empty());
        let expired = agg.expire(31_001);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].record.status, FileStatus::Incomplete);
        assert_eq!(expired[0].record.size_bytes, 5);
        assert!(!agg.is_active("phone-1"));
    }

    #[test]
    fn exact_size_cut_short_by_disconnect_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.mp4", 3, &[], 0).unwrap();
        agg.on_file_chunk("phone-1", b"abc", 1).unwrap();
        let done = agg.abandon("phone-1", 2).unwrap();
        assert_eq!(done.record.status, FileStatus::Incomplete);
        assert!(agg.abandon("phone-1", 3).is_none());
    }

    #[test]
    fn data_stays_hidden_until_close() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.mp4", 3, &[], 0).unwrap();
        agg.on_file_chunk("phone-1", b"abc", 1).unwrap();
        assert!(!dir.path().join("phone-1/a.mp4").exists());
        assert!(dir.path().join("phone-1/.a.mp4.part").exists());
        agg.on_file_end("phone-1", "a.mp4", 2).unwrap();
        assert_eq!(fs::read(dir.path().join("phone-1/a.mp4")).unwrap(), b"abc");
        assert!(!dir.path().join("phone-1/.a.mp4.part").exists());
    }

    #[test]
    fn partial_resend_keeps_committed_copy() {
        let dir = TempDir::new().unwrap();
        let data = payload(1000);
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "video.mp4", 1000, &[], 0).unwrap();
        agg.on_file_chunk("phone-1", &data, 1).unwrap();
        let first = agg.on_file_end("phone-1", "video.mp4", 2).unwrap();
        assert_eq!(first.record.status, FileStatus::Complete);
        assert!(!first.discarded);

        let committed = vec![first.record.clone()];
        agg.on_file_info(dir.path(), "phone-1", "video.mp4", 1000, &committed, 10)
            .unwrap();
        agg.on_file_chunk("phone-1", &data[..300], 11).unwrap();
        let second = agg.abandon("phone-1", 12).unwrap();
        assert!(second.discarded);
        assert_eq!(second.record.status, FileStatus::Incomplete);
        assert_eq!(fs::read(dir.path().join("phone-1/video.mp4")).unwrap(), data);
        assert!(!dir.path().join("phone-1/.video.mp4.part").exists());
    }

    #[test]
    fn complete_resend_replaces_committed_copy() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.csv", 3, &[], 0).unwrap();
        agg.on_file_chunk("phone-1", b"old", 1).unwrap();
        let first = agg.on_file_end("phone-1", "a.csv", 2).unwrap();

        agg.on_file_info(dir.path(), "phone-1", "a.csv", 3, &[first.record], 3)
            .unwrap();
        agg.on_file_chunk("phone-1", b"new", 4).unwrap();
        let second = agg.on_file_end("phone-1", "a.csv", 5).unwrap();
        assert!(!second.discarded);
        assert_eq!(second.record.status, FileStatus::Complete);
        assert_eq!(fs::read(dir.path().join("phone-1/a.csv")).unwrap(), b"new");
    }

    #[test]
    fn failed_write_closes_transfer_at_last_good_byte() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        agg.on_file_info(dir.path(), "phone-1", "a.mp4", 10, &[], 0).unwrap();
        agg.on_file_chunk("phone-1", b"01234", 1).unwrap();
        let part = dir.path().join("phone-1/.a.mp4.part");
        // A read-only handle makes the next write fail.
        agg.active.get_mut("phone-1").unwrap().file = File::open(&part).unwrap();

        let ChunkOutcome::Failed(done) = agg.on_file_chunk("phone-1", b"56789", 2).unwrap() else {
            panic!("write should have failed");
        };
        assert!(!agg.is_active("phone-1"));
        assert_eq!(done.record.status, FileStatus::Incomplete);
        assert_eq!(done.record.size_bytes, 5);
        assert_eq!(done.reply.status, TransferStatus::Error);
        assert_eq!(fs::read(dir.path().join("phone-1/a.mp4")).unwrap(), b"01234");
        assert!(matches!(
            agg.on_file_chunk("phone-1", b"x", 3),
            Err(AggregationError::NoOpenTransfer(_))
        ));
    }

    #[test]
    fn device_id_with_path_parts_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut agg = FileAggregator::new(30_000);
        for id in ["../phone-1", "a/phone-1", "..", ""] {
            assert!(matches!(
                agg.on_file_info(dir.path(), id, "a.mp4", 3, &[], 0),
                Err(AggregationError::InvalidDeviceId(_))
            ));
        }
        assert_eq!(agg.active_count(), 0);
    }
}
