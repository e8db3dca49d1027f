use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::address::{AddressId, AddressStatus, TransitionReason};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::scheduler::BatchOperation;

const JOURNAL_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    Transition {
        address_id: AddressId,
        from: AddressStatus,
        to: AddressStatus,
        reason: TransitionReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    BatchFinished {
        operation: BatchOperation,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: bool,
        cache_hits: usize,
        provider_calls: usize,
    },
    Imported {
        source: String,
        rows: usize,
        created: usize,
        duplicates: usize,
        rejected: usize,
    },
}

#[derive(Debug, Serialize)]
struct JournalEntry {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: JournalEvent,
}

/// Append-only JSONL log of what happened to addresses. Events are
/// buffered in memory and written in batches; the file is rotated by size.
#[derive(Clone)]
pub struct EventJournal {
    enabled: bool,
    queue: Arc<Mutex<Vec<JournalEntry>>>,
    path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl EventJournal {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            enabled: config.journal_enabled,
            queue: Arc::new(Mutex::new(Vec::new())),
            path,
            batch_size: config.journal_batch_size.max(1),
            max_file_bytes: config.journal_buffer_max_bytes,
            max_file_count: config.journal_buffer_max_files,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            queue: Arc::new(Mutex::new(Vec::new())),
            path: PathBuf::new(),
            batch_size: 1,
            max_file_bytes: 0,
            max_file_count: 1,
        }
    }

    /// Journals `event`; a failing write is logged and otherwise ignored.
    pub fn record(&self, event: JournalEvent) {
        if let Err(err) = self.try_record(event) {
            warn!(?err, path = %self.path.display(), "failed to write journal batch");
        }
    }

    /// Queues `event` and writes the queue once it reaches the batch size.
    /// On error the queued events are kept for the next attempt.
    pub fn try_record(&self, event: JournalEvent) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        queue.push(JournalEntry {
            timestamp: Utc::now(),
            event,
        });
        if queue.len() < self.batch_size {
            return Ok(());
        }
        self.drain(&mut queue)
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.drain(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn drain(&self, queue: &mut Vec<JournalEntry>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut chunk = Vec::new();
        for entry in queue.iter() {
            serde_json::to_writer(&mut chunk, entry)?;
            chunk.push(b'\n');
        }
        if self.needs_rollover(chunk.len() as u64) {
            self.roll_over()?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&chunk)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn needs_rollover(&self, incoming: u64) -> bool {
        match fs::metadata(&self.path) {
            Ok(meta) => meta.len() > 0 && meta.len() + incoming > self.max_file_bytes,
            Err(_) => false,
        }
    }

    /// Moves the current file aside under a timestamped name, keeping at
    /// most `max_file_count - 1` old files. With a single file allowed the
    /// journal is simply truncated.
    fn roll_over(&self) -> AppResult<()> {
        if self.max_file_count > 1 {
            let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
            fs::rename(&self.path, self.directory().join(format!("{}-{stamp}.jsonl", self.stem())))?;
            let mut old = self.rotated_files()?;
            let keep = self.max_file_count - 1;
            if old.len() > keep {
                old.sort();
                for stale in &old[..old.len() - keep] {
                    if let Err(err) = fs::remove_file(stale) {
                        warn!(?err, path = %stale.display(), "failed to prune journal file");
                    }
                }
            }
        }
        fs::File::create(&self.path)?;
        Ok(())
    }

    /// Rotated files sort by the timestamp in their name.
    fn rotated_files(&self) -> AppResult<Vec<PathBuf>> {
        let prefix = format!("{}-", self.stem());
        let mut files = Vec::new();
        for entry in fs::read_dir(self.directory())? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                files.push(self.directory().join(name));
            }
        }
        Ok(files)
    }

    fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map_or_else(|| "events".into(), |stem| stem.to_string_lossy().into_owned())
    }
}
