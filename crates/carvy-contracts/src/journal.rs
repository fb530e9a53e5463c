//! Per-request pipeline journal (`events.jsonl`).
//!
//! Every line is one [`JournalEntry`]: the session and request it belongs
//! to, the artifact key, a UTC timestamp and a typed [`JournalEvent`]
//! flattened next to them under `type`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::outcomes::Stage;
use crate::requests::VehicleImageRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Generate,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    RequestStarted {
        workflow: Workflow,
        /// Studio prompt template used for generation; absent for uploads.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_template_version: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vehicle: Option<VehicleImageRequest>,
    },
    CacheHit {
        url: String,
    },
    Conflict {
        url: String,
    },
    StageCompleted {
        stage: Stage,
        bytes: usize,
    },
    ArtifactCreated {
        url: String,
        bytes: usize,
        sha256: String,
    },
    RequestFailed {
        stage: Stage,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub session_id: String,
    pub request_id: String,
    pub key: String,
    pub ts: String,
    #[serde(flatten)]
    pub event: JournalEvent,
}

/// Append handle shared by all requests of one process session.
#[derive(Debug, Clone)]
pub struct RequestJournal {
    session_id: Arc<str>,
    sink: Arc<Mutex<File>>,
}

impl RequestJournal {
    pub fn open(path: &Path, session_id: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        Ok(Self {
            session_id: Arc::from(session_id.into()),
            sink: Arc::new(Mutex::new(file)),
        })
    }

    pub fn record(&self, request_id: &str, key: &str, event: JournalEvent) -> Result<JournalEntry> {
        let entry = JournalEntry {
            session_id: self.session_id.to_string(),
            request_id: request_id.to_string(),
            key: key.to_string(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        // one write per entry keeps concurrent lines whole
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
        sink.write_all(&line).context("failed to append journal entry")?;
        Ok(entry)
    }
}

pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read journal {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed journal entry", path.display(), idx + 1))
        })
        .collect()
}
