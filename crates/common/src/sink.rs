//! Append-only storage for captured telemetry.
//!
//! Workers append one [`CaptureRecord`] per successful step, before the next
//! step starts. A record is durable once `append` returns and is never
//! retracted, whatever happens to the rest of the sequence.

use crate::error::SinkError;
use crate::types::{CaptureType, Site, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub site: Site,
    pub worker_id: WorkerId,
    pub capture_type: CaptureType,
    pub step_index: usize,
    pub captured_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl CaptureRecord {
    pub fn new(
        site: Site,
        worker_id: WorkerId,
        capture_type: CaptureType,
        step_index: usize,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            site,
            worker_id,
            capture_type,
            step_index,
            captured_at: Utc::now(),
            payload,
        }
    }
}

#[async_trait]
pub trait DataSink: Send + Sync {
    /// Store one record; durable on return
    async fn append(&self, record: &CaptureRecord) -> Result<(), SinkError>;

    /// Push buffered state to storage, called once at shutdown
    async fn flush(&self) -> Result<(), SinkError>;
}

/// Append `record`, retrying up to `attempts` times in total with a fixed
/// `backoff` between tries. Returns the last error when every try failed.
pub async fn append_with_retry(
    sink: &dyn DataSink,
    record: &CaptureRecord,
    attempts: u32,
    backoff: Duration,
) -> Result<(), SinkError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match sink.append(record).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(
                    "Sink append for {} ({}) failed (attempt {}/{}): {}",
                    record.site, record.capture_type, attempt, attempts, e
                );
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-process sink, mostly for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<CaptureRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CaptureRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn records_for(&self, site: &Site, worker_id: WorkerId) -> Vec<CaptureRecord> {
        self.records()
            .into_iter()
            .filter(|r| &r.site == site && r.worker_id == worker_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn append(&self, record: &CaptureRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError::Closed)?
            .push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// JSON-lines files under a data directory, one file per capture type
/// (`http_traffic.jsonl`, `cookies.jsonl`, `custom.jsonl`).
///
/// Every record is written as a single line and synced before `append`
/// returns. The sink remembers where the last acknowledged record ends and
/// truncates anything past it before writing, so a failed write never
/// leaves a half line for the next record to be glued onto.
pub struct JsonlSink {
    directory: PathBuf,
    files: tokio::sync::Mutex<HashMap<CaptureType, JsonlFile>>,
}

struct JsonlFile {
    file: File,
    /// Length up to the end of the last acknowledged record
    committed: u64,
}

impl JsonlFile {
    /// Cut off whatever a failed append left after the last complete record
    async fn discard_torn_tail(&mut self, path: &Path) -> Result<(), SinkError> {
        let len = self.file.metadata().await?.len();
        if len > self.committed {
            warn!(
                "Discarding {} byte(s) of an incomplete record in {}",
                len - self.committed,
                path.display()
            );
            self.file.set_len(self.committed).await?;
        } else if len < self.committed {
            self.committed = len;
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
        self.file.write_all(line).await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

impl JsonlSink {
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self, SinkError> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        info!("Writing captures to {}", directory.display());

        Ok(Self {
            directory,
            files: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, capture_type: CaptureType) -> PathBuf {
        self.directory
            .join(format!("{}.jsonl", capture_type.as_str()))
    }
}

#[async_trait]
impl DataSink for JsonlSink {
    async fn append(&self, record: &CaptureRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        // Held across the write so lines never interleave
        let mut files = self.files.lock().await;
        let path = self.path_for(record.capture_type);
        if !files.contains_key(&record.capture_type) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            let committed = file.metadata().await?.len();
            files.insert(record.capture_type, JsonlFile { file, committed });
        }
        let entry = files
            .get_mut(&record.capture_type)
            .ok_or(SinkError::Closed)?;

        entry.discard_torn_tail(&path).await?;
        if let Err(e) = entry.write_line(&line).await {
            // A later append retries the truncation if this one fails too
            if let Err(truncate) = entry.file.set_len(entry.committed).await {
                warn!("Could not roll back {}: {}", path.display(), truncate);
            }
            return Err(e);
        }
        entry.committed += line.len() as u64;

        debug!(
            "Appended {} capture for {} from {}",
            record.capture_type, record.site, record.worker_id
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut files = self.files.lock().await;
        for entry in files.values_mut() {
            entry.file.flush().await?;
            entry.file.sync_all().await?;
        }
        Ok(())
    }
}
