//! Snapshot/error sink: write-only, bounded capture of per-stage artifacts.
//!
//! Snapshots are observability, never state of truth: writes are best-effort,
//! non-blocking, and can never fail a request. Layout on disk is
//! `<root>/<entryProtocol>/<providerKey>/<requestId>/<stage>.json`, with
//! failure samples additionally grouped under a per-reason directory that is
//! capped to a rolling file count.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use routecodex_common::EntryProtocol;

/// Rolling cap of files kept per failure reason.
pub const DEFAULT_REASON_CAP: usize = 250;

const QUEUE_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Req,
    Resp,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub request_id: String,
    pub entry_protocol: EntryProtocol,
    pub provider_key: String,
    pub stage: String,
    pub direction: Direction,
    pub payload: Value,
    #[serde(skip)]
    pub timestamp: SystemTime,
    /// Failure samples carry a reason and land under `<stage>/<reason>/` too.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Snapshot {
    pub fn new(
        request_id: impl Into<String>,
        entry_protocol: EntryProtocol,
        provider_key: impl Into<String>,
        stage: impl Into<String>,
        direction: Direction,
        payload: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            entry_protocol,
            provider_key: provider_key.into(),
            stage: stage.into(),
            direction,
            payload,
            timestamp: SystemTime::now(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Seam the pipeline records through. Implementations must not block.
pub trait SnapshotSink: Send + Sync {
    fn record(&self, snapshot: Snapshot);
}

pub type SharedSnapshotSink = Arc<dyn SnapshotSink>;

/// Discards everything; used when no samples directory is configured.
#[derive(Debug, Default)]
pub struct NoopSnapshotSink;

impl SnapshotSink for NoopSnapshotSink {
    fn record(&self, _snapshot: Snapshot) {}
}

/// Filesystem sink: snapshots are queued onto an mpsc channel and written by
/// a background task; a full queue drops the snapshot rather than blocking
/// the request path.
pub struct FsSnapshotSink {
    tx: mpsc::Sender<Snapshot>,
}

impl FsSnapshotSink {
    pub fn spawn(root: impl Into<PathBuf>) -> Self {
        Self::spawn_with_cap(root, DEFAULT_REASON_CAP)
    }

    pub fn spawn_with_cap(root: impl Into<PathBuf>, reason_cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let root = root.into();
        tokio::spawn(writer_task(root, reason_cap, rx));
        Self { tx }
    }
}

impl SnapshotSink for FsSnapshotSink {
    fn record(&self, snapshot: Snapshot) {
        let _ = self.tx.try_send(snapshot);
    }
}

async fn writer_task(root: PathBuf, reason_cap: usize, mut rx: mpsc::Receiver<Snapshot>) {
    while let Some(snapshot) = rx.recv().await {
        if let Err(err) = write_snapshot(&root, reason_cap, &snapshot).await {
            debug!(
                event = "snapshot_write_failed",
                request_id = %snapshot.request_id,
                stage = %snapshot.stage,
                error = %err
            );
        }
    }
}

async fn write_snapshot(
    root: &Path,
    reason_cap: usize,
    snapshot: &Snapshot,
) -> std::io::Result<()> {
    let dir = root
        .join(snapshot.entry_protocol.as_str())
        .join(sanitize(&snapshot.provider_key))
        .join(sanitize(&snapshot.request_id));
    tokio::fs::create_dir_all(&dir).await?;

    let body = render(snapshot);
    let file = dir.join(format!(
        "{}-{}.json",
        sanitize(&snapshot.stage),
        match snapshot.direction {
            Direction::Req => "request",
            Direction::Resp => "response",
        }
    ));
    tokio::fs::write(&file, &body).await?;

    if let Some(reason) = &snapshot.reason {
        let reason_dir = root
            .join(sanitize(&snapshot.stage))
            .join(sanitize(reason));
        tokio::fs::create_dir_all(&reason_dir).await?;
        enforce_reason_cap(&reason_dir, reason_cap).await?;
        let sample = reason_dir.join(format!("{}.json", sanitize(&snapshot.request_id)));
        tokio::fs::write(&sample, &body).await?;
    }
    Ok(())
}

/// Keep at most `cap - 1` existing files so the incoming write lands within
/// the cap; the oldest names (lexicographically earliest) are removed first.
async fn enforce_reason_cap(dir: &Path, cap: usize) -> std::io::Result<()> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name());
    }
    if names.len() < cap {
        return Ok(());
    }
    names.sort();
    let excess = names.len() + 1 - cap;
    for name in names.into_iter().take(excess) {
        let _ = tokio::fs::remove_file(dir.join(name)).await;
    }
    Ok(())
}

fn render(snapshot: &Snapshot) -> Vec<u8> {
    let timestamp = time::OffsetDateTime::from(snapshot.timestamp)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let value = serde_json::json!({
        "requestId": snapshot.request_id,
        "entryProtocol": snapshot.entry_protocol.as_str(),
        "providerKey": snapshot.provider_key,
        "stage": snapshot.stage,
        "direction": snapshot.direction,
        "timestamp": timestamp,
        "payload": snapshot.payload,
        "reason": snapshot.reason,
    });
    serde_json::to_vec_pretty(&value).unwrap_or_default()
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
