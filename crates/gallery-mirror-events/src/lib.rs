//! Append-only JSONL event log for synchronizer passes.
//!
//! Every [`SyncEvent`] the synchronizer records during a pass is both
//! logged through `tracing` (for live operators) and appended here (for
//! offline audit of what happened to a specific extension or binary across
//! many passes).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gallery_mirror_types::Result;
use serde::{Deserialize, Serialize};

/// Default events file name, relative to the artifact store root.
pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// What happened, and to which group ("binary" or `publisher.name`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    PassStarted { mode: String },
    PassFinished {
        extensions_completed: u64,
        extensions_failed: u64,
        binaries_completed: u64,
        binaries_failed: u64,
        duration_ms: u64,
    },
    PassFailed { reason: String },
    ExtensionSkipped { reason: String },
    ItemDownloadStarted { dest_relpath: String },
    ItemDownloadSucceeded { dest_relpath: String, bytes: u64 },
    ItemDownloadFailed { dest_relpath: String, message: String },
    RetentionPurged { dest_relpath: String },
    LockContended { holder: String },
}

/// A single timestamped, grouped entry in the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncEvent {
    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub kind: EventKind,
}

impl SyncEvent {
    pub fn new(group: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            group: group.into(),
            kind,
        }
    }
}

/// Append-only event log, buffered in memory until [`EventLog::write_to_file`].
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<SyncEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    /// Append all recorded events to `path` in JSONL format, creating the
    /// file (and its parent directory) if it doesn't exist yet.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event)
                .map_err(|e| gallery_mirror_types::Error::RequestMalformed(e.to_string()))?;
            writeln!(writer, "{line}")?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: SyncEvent = serde_json::from_str(&line)
                .map_err(|e| gallery_mirror_types::Error::RequestMalformed(e.to_string()))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_group<'a>(&'a self, group: &str) -> Vec<&'a SyncEvent> {
        self.events.iter().filter(|e| e.group == group).collect()
    }

    pub fn all_events(&self) -> &[SyncEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
