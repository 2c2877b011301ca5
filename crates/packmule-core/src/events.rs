//! Append-only JSONL event log for update runs.
//!
//! Mirrors `shipper-events::EventLog` ("record" + "write_to_file" +
//! "read_from_file" + "events_for_package"-style API), here scoped to one
//! tool's update history instead of a publish run's package history.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub timestamp: DateTime<Utc>,
    pub tool_id: String,
    pub event_type: UpdateEventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEventType {
    UpdateStarted {
        from_version: Option<String>,
        target_version: String,
    },
    FileDownloaded {
        path: String,
        bytes: u64,
    },
    FileVerified {
        path: String,
    },
    FileSkipped {
        path: String,
    },
    StagingPromoted {
        version: String,
    },
    PointerFlipped {
        version: String,
    },
    ReleaseReclaimed {
        version: String,
    },
    UpdateFailed {
        kind: ErrorKind,
        message: String,
    },
}

/// Append-only event log for update operations.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<UpdateEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: UpdateEvent) {
        self.events.push(event);
    }

    /// Append all recorded events to `path` in JSONL format, creating the
    /// file (and its parent directory) if absent.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: UpdateEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_tool(&self, tool_id: &str) -> Vec<&UpdateEvent> {
        self.events.iter().filter(|e| e.tool_id == tool_id).collect()
    }

    pub fn all_events(&self) -> &[UpdateEvent] {
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
