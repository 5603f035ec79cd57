//! Append-only JSONL writer with size and timed rotation.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Duration, Local, NaiveDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{LOG_FILE_NAME, ProxyInfo, RequestLog};
use crate::config::{LogSettings, RotationSpec};

/// Everything the handler knows about a served request; the writer adds the
/// record id and timestamp at write time.
#[derive(Debug, Clone)]
pub struct LogDraft {
    pub mock_service_id: Option<u64>,
    pub mock_service_name: Option<String>,
    pub path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: String,
    pub response_status: u16,
    pub response_body: String,
    pub response_headers: BTreeMap<String, String>,
    pub processing_time: f64,
    pub proxy_info: Option<ProxyInfo>,
}

struct WriterState {
    file: File,
    size: u64,
    next_rollover: Option<NaiveDateTime>,
    last_stamp: NaiveDateTime,
}

/// The sole producer of request-log records.
///
/// Serialization and the file write happen under one mutex, so records land
/// whole and in order. After the write returns, the record goes to the hub
/// channel; a full channel drops the live event with a warning, the file
/// stays authoritative.
pub struct LogWriter {
    dir: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    rotation: Option<RotationSpec>,
    state: Mutex<WriterState>,
    events: mpsc::Sender<RequestLog>,
}

impl LogWriter {
    /// Create the log directory if needed and open the active file.
    pub fn new(settings: &LogSettings, events: mpsc::Sender<RequestLog>) -> io::Result<Self> {
        fs::create_dir_all(&settings.dir)?;
        let path = settings.dir.join(LOG_FILE_NAME);
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        let now = Local::now().naive_local();
        Ok(Self {
            dir: settings.dir.clone(),
            max_bytes: settings.max_bytes,
            backup_count: settings.backup_count,
            rotation: settings.rotation,
            state: Mutex::new(WriterState {
                file,
                size,
                next_rollover: settings.rotation.map(|r| r.next_boundary(now)),
                last_stamp: NaiveDateTime::MIN,
            }),
            events,
        })
    }

    /// Path of the active log file.
    pub fn active_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    /// Persist one record and emit it to the hub channel.
    ///
    /// # Errors
    ///
    /// Only I/O failures surface; callers log them and keep serving, the
    /// client response must not depend on the log.
    pub fn append(&self, draft: LogDraft) -> io::Result<RequestLog> {
        let mut state = self.state.lock().expect("log writer mutex poisoned");

        // Clock readings can collide or step backwards; the record id must
        // stay strictly monotonic.
        let mut now = Local::now().naive_local();
        if now <= state.last_stamp {
            now = state.last_stamp + Duration::microseconds(1);
        }
        state.last_stamp = now;

        let record = RequestLog {
            id: now.format("%Y%m%d_%H%M%S_%6f").to_string(),
            mock_service_id: draft.mock_service_id,
            mock_service_name: draft.mock_service_name,
            path: draft.path,
            method: draft.method,
            headers: draft.headers,
            query_params: draft.query_params,
            body: draft.body,
            response_status: draft.response_status,
            response_body: draft.response_body,
            response_headers: draft.response_headers,
            processing_time: draft.processing_time,
            timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            proxy_info: draft.proxy_info,
        };

        let mut line = serde_json::to_string(&record).map_err(io::Error::other)?;
        line.push('\n');

        match (self.rotation, state.next_rollover) {
            (Some(spec), Some(boundary)) if now >= boundary => {
                self.rotate_by_time(&mut state, spec, boundary)?;
                state.next_rollover = Some(spec.next_boundary(now));
            }
            (None, _) => {
                if state.size > 0 && state.size + line.len() as u64 > self.max_bytes {
                    self.rotate_by_size(&mut state)?;
                }
            }
            _ => {}
        }

        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;
        state.size += line.len() as u64;

        // Fan-out starts only after the write returned, so a reader polling
        // on a live event always finds the record on disk.
        if let Err(error) = self.events.try_send(record.clone()) {
            warn!(%error, "live log event dropped");
        }
        Ok(record)
    }

    /// Cascade `requests.log.N` to `.N+1`, dropping the oldest archive.
    fn rotate_by_size(&self, state: &mut WriterState) -> io::Result<()> {
        let base = self.active_path();
        debug!(path = %base.display(), "rotating request log by size");

        if self.backup_count == 0 {
            state.file = File::create(&base)?;
            state.size = 0;
            return Ok(());
        }

        let numbered = |n: usize| PathBuf::from(format!("{}.{n}", base.display()));
        let oldest = numbered(self.backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.backup_count).rev() {
            let from = numbered(n);
            if from.exists() {
                fs::rename(&from, numbered(n + 1))?;
            }
        }
        state.file.flush()?;
        fs::rename(&base, numbered(1))?;
        state.file = open_append(&base)?;
        state.size = 0;
        Ok(())
    }

    /// Archive the active file under a date-stamped name and prune old
    /// archives beyond the retention count.
    fn rotate_by_time(
        &self,
        state: &mut WriterState,
        spec: RotationSpec,
        boundary: NaiveDateTime,
    ) -> io::Result<()> {
        let base = self.active_path();
        let period_start = boundary - spec.interval();
        let suffix = period_start.format(spec.archive_suffix_format()).to_string();
        let archive = PathBuf::from(format!("{}.{suffix}", base.display()));
        debug!(path = %base.display(), archive = %archive.display(), "rotating request log by time");

        if archive.exists() {
            fs::remove_file(&archive)?;
        }
        state.file.flush()?;
        fs::rename(&base, &archive)?;
        state.file = open_append(&base)?;
        state.size = 0;

        // Prune: dated archives sort lexicographically in time order.
        let prefix = format!("{LOG_FILE_NAME}.");
        let mut archives: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && !is_numbered_suffix(&n[prefix.len()..]))
            })
            .collect();
        archives.sort();
        while archives.len() > self.backup_count {
            let victim = archives.remove(0);
            debug!(path = %victim.display(), "removing expired log archive");
            fs::remove_file(&victim)?;
        }
        Ok(())
    }
}

fn open_append(path: &std::path::Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn is_numbered_suffix(suffix: &str) -> bool {
    !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn draft(body: &str) -> LogDraft {
        LogDraft {
            mock_service_id: Some(1),
            mock_service_name: Some("svc".into()),
            path: "/x".into(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body: body.into(),
            response_status: 200,
            response_body: "ok".into(),
            response_headers: BTreeMap::new(),
            processing_time: 0.001,
            proxy_info: None,
        }
    }

    fn writer_with(dir: &TempDir, max_bytes: u64, backup_count: usize) -> (LogWriter, mpsc::Receiver<RequestLog>) {
        let (tx, rx) = mpsc::channel(64);
        let settings = LogSettings {
            dir: dir.path().to_path_buf(),
            max_bytes,
            backup_count,
            rotation: None,
        };
        (LogWriter::new(&settings, tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_record_is_written_as_json_line() {
        let dir = TempDir::new().unwrap();
        let (writer, mut rx) = writer_with(&dir, 1024 * 1024, 2);
        let record = writer.append(draft("hello")).unwrap();

        let content = fs::read_to_string(writer.active_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: RequestLog = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);

        // The live event carries the same record.
        let event = rx.recv().await.unwrap();
        assert_eq!(event, record);
    }

    #[tokio::test]
    async fn test_ids_are_strictly_monotonic() {
        let dir = TempDir::new().unwrap();
        let (writer, _rx) = writer_with(&dir, 1024 * 1024, 2);
        let mut previous = String::new();
        for _ in 0..50 {
            let record = writer.append(draft("x")).unwrap();
            assert!(record.id > previous, "{} !> {previous}", record.id);
            previous = record.id;
        }
    }

    #[tokio::test]
    async fn test_size_rotation_cascade() {
        let dir = TempDir::new().unwrap();
        // Each record line is well over 200 bytes, so every append rotates.
        let (writer, _rx) = writer_with(&dir, 200, 2);
        for i in 0..5 {
            writer.append(draft(&format!("record number {i} {}", "x".repeat(64)))).unwrap();
        }
        let base = writer.active_path();
        assert!(base.exists());
        assert!(PathBuf::from(format!("{}.1", base.display())).exists());
        assert!(PathBuf::from(format!("{}.2", base.display())).exists());
        assert!(!PathBuf::from(format!("{}.3", base.display())).exists());
    }

    #[tokio::test]
    async fn test_rotation_preserves_latest_records() {
        let dir = TempDir::new().unwrap();
        let (writer, _rx) = writer_with(&dir, 200, 2);
        let mut last_id = String::new();
        for i in 0..5 {
            last_id = writer.append(draft(&format!("record {i} {}", "y".repeat(64)))).unwrap().id;
        }
        // The newest record is in the freshly rotated active file.
        let content = fs::read_to_string(writer.active_path()).unwrap();
        assert!(content.contains(&last_id));
    }

    #[tokio::test]
    async fn test_zero_backup_count_truncates() {
        let dir = TempDir::new().unwrap();
        let (writer, _rx) = writer_with(&dir, 150, 0);
        for _ in 0..4 {
            writer.append(draft(&"z".repeat(80))).unwrap();
        }
        let base = writer.active_path();
        assert!(base.exists());
        assert!(!PathBuf::from(format!("{}.1", base.display())).exists());
    }

    #[tokio::test]
    async fn test_full_channel_does_not_fail_append() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let settings = LogSettings {
            dir: dir.path().to_path_buf(),
            max_bytes: 1024 * 1024,
            backup_count: 1,
            rotation: None,
        };
        let writer = LogWriter::new(&settings, tx).unwrap();
        for _ in 0..5 {
            writer.append(draft("spam")).unwrap();
        }
        let content = fs::read_to_string(writer.active_path()).unwrap();
        assert_eq!(content.lines().count(), 5);
    }
}
