//! Archive of resolved verification cases.
//!
//! Closed cases are appended to a JSON-lines file by a background worker. The
//! pipeline only pushes records onto a channel, so archiving never blocks a
//! resolution; the worker flushes on an interval and when asked to.

use crate::verification::state::{CaseState, VerificationCase};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub archived_at: DateTime<Utc>,
    pub final_state: CaseState,
    pub case: VerificationCase,
}

impl AuditRecord {
    pub fn new(case: &VerificationCase, at: DateTime<Utc>) -> Self {
        Self {
            archived_at: at,
            final_state: case.state,
            case: case.clone(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn archive(&self, case: &VerificationCase);
}

enum AuditCommand {
    Record(Box<AuditRecord>),
    Flush(oneshot::Sender<()>),
}

pub struct AuditLog {
    path: String,
    sender: mpsc::UnboundedSender<AuditCommand>,
    _handle: tokio::task::JoinHandle<()>,
}

impl AuditLog {
    pub fn new(path: String, flush_interval_seconds: u64) -> Result<Self> {
        if let Some(parent) = Path::new(&path).parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create audit directory: {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log: {path}"))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = Self::audit_worker(file, receiver, flush_interval_seconds).await {
                log::error!("Audit worker error: {e}");
            }
        });

        Ok(Self {
            path,
            sender,
            _handle: handle,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(AuditCommand::Flush(tx)).is_err() {
            log::warn!("Audit worker is gone, nothing to flush");
            return;
        }
        if rx.await.is_err() {
            log::warn!("Audit worker stopped before acknowledging flush");
        }
    }

    async fn audit_worker(
        file: std::fs::File,
        mut receiver: mpsc::UnboundedReceiver<AuditCommand>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let mut writer = BufWriter::new(file);
        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds.max(1)));
        let mut pending = 0usize;

        loop {
            tokio::select! {
                command = receiver.recv() => {
                    match command {
                        Some(AuditCommand::Record(record)) => {
                            serde_json::to_writer(&mut writer, &record)?;
                            writer.write_all(b"\n")?;
                            pending += 1;
                        }
                        Some(AuditCommand::Flush(ack)) => {
                            writer.flush()?;
                            pending = 0;
                            let _ = ack.send(());
                        }
                        None => {
                            // Channel closed, flush and exit
                            writer.flush()?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if pending > 0 {
                        if let Err(e) = writer.flush() {
                            log::error!("Failed to flush audit log: {e}");
                        } else {
                            log::debug!("Flushed {pending} audit record(s)");
                            pending = 0;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

impl AuditSink for AuditLog {
    fn archive(&self, case: &VerificationCase) {
        let record = AuditRecord::new(case, Utc::now());
        if let Err(e) = self.sender.send(AuditCommand::Record(Box::new(record))) {
            log::warn!("Failed to queue audit record for case {}: {e}", case.case_id);
        }
    }
}

/// Keeps archived records in memory, for tests and dry runs
#[derive(Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for MemoryAudit {
    fn archive(&self, case: &VerificationCase) {
        let record = AuditRecord::new(case, Utc::now());
        match self.records.lock() {
            Ok(mut r) => r.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Read an audit file back, skipping lines that do not parse.
pub fn read_audit_log(path: &str) -> Result<Vec<AuditRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit log: {path}"))?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping malformed audit line: {e}");
                None
            }
        })
        .collect())
}
