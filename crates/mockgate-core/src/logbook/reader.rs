//! Query side of the log pipeline: scan, filter, paginate.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;

use super::{LOG_FILE_NAME, RequestLog};
use crate::config::{LogSettings, RotationSpec};

/// Metadata about one log file, for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub file: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub modified: String,
    pub max_size_mb: f64,
    pub backup_count: usize,
    pub rotation_type: &'static str,
}

/// Reads records back out of the active log and its archives.
///
/// The reader holds no file handles between calls; every query re-scans, so
/// it always observes what the writer has flushed, rotation included.
#[derive(Debug, Clone)]
pub struct LogReader {
    dir: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    rotation: Option<RotationSpec>,
}

impl LogReader {
    pub fn new(settings: &LogSettings) -> Self {
        Self {
            dir: settings.dir.clone(),
            max_bytes: settings.max_bytes,
            backup_count: settings.backup_count,
            rotation: settings.rotation,
        }
    }

    /// Fetch records, newest first.
    ///
    /// Filters by `mock_service_id` when `service_id` is given, then
    /// applies `[skip, skip + limit)`. Lines that fail to parse are
    /// silently skipped; a rotated-away file mid-scan is skipped too.
    pub fn get(&self, service_id: Option<u64>, skip: usize, limit: usize) -> Vec<RequestLog> {
        let mut records = Vec::new();
        for path in self.log_files() {
            let Ok(file) = File::open(&path) else {
                continue;
            };
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<RequestLog>(trimmed) else {
                    continue;
                };
                if service_id.is_none() || record.mock_service_id == service_id {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.into_iter().skip(skip).take(limit).collect()
    }

    /// Size, mtime and rotation metadata for every log file present.
    pub fn files_info(&self) -> Vec<LogFileInfo> {
        let rotation_type = if self.rotation.is_some() { "time" } else { "size" };
        self.log_files()
            .into_iter()
            .filter_map(|path| {
                let meta = fs::metadata(&path).ok()?;
                let modified = meta
                    .modified()
                    .ok()
                    .map(|mtime| {
                        DateTime::<Local>::from(mtime)
                            .naive_local()
                            .format("%Y-%m-%dT%H:%M:%S%.6f")
                            .to_string()
                    })
                    .unwrap_or_default();
                Some(LogFileInfo {
                    file: path.file_name()?.to_str()?.to_string(),
                    size_bytes: meta.len(),
                    size_mb: round2(meta.len() as f64 / (1024.0 * 1024.0)),
                    modified,
                    max_size_mb: round2(self.max_bytes as f64 / (1024.0 * 1024.0)),
                    backup_count: self.backup_count,
                    rotation_type,
                })
            })
            .collect()
    }

    /// The active file, numbered archives in order, then dated archives
    /// newest first.
    fn log_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let base = self.dir.join(LOG_FILE_NAME);
        if base.exists() {
            files.push(base.clone());
        }
        for n in 1..=self.backup_count {
            let numbered = PathBuf::from(format!("{}.{n}", base.display()));
            if numbered.exists() {
                files.push(numbered);
            }
        }

        let prefix = format!("{LOG_FILE_NAME}.");
        let mut dated: Vec<PathBuf> = fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name().and_then(|n| n.to_str()).is_some_and(|name| {
                    name.strip_prefix(&prefix)
                        .is_some_and(|suffix| !suffix.is_empty() && !suffix.bytes().all(|b| b.is_ascii_digit()))
                })
            })
            .collect();
        dated.sort();
        dated.reverse();
        files.extend(dated);
        files
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
