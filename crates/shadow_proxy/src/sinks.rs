use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use comparator::Resolution;
use core_types::{Outcome, TimeoutNotice, Verdict, VerdictRecord, VerdictSink};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const JSONL_FLUSH_BATCH: usize = 256;

/// Fans each resolution out to every registered sink.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn VerdictSink>>,
}

impl SinkSet {
    pub fn push(&mut self, sink: Arc<dyn VerdictSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn publish(&self, resolution: &Resolution) {
        match resolution {
            Resolution::Complete(verdict) => {
                for sink in &self.sinks {
                    sink.record_verdict(verdict);
                }
            }
            Resolution::TimedOut(notice) | Resolution::Abandoned(notice) => {
                for sink in &self.sinks {
                    sink.record_timeout(notice);
                }
            }
        }
    }
}

fn side_status(outcome: &Outcome) -> String {
    match (outcome.status(), outcome.failure_stage()) {
        (Some(status), _) => status.as_u16().to_string(),
        (None, Some(stage)) => format!("failed:{stage}"),
        (None, None) => "unknown".to_string(),
    }
}

fn side_body(outcome: &Outcome) -> String {
    outcome
        .body()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

/// One log line per verdict: durations on a match, statuses and bodies on a
/// mismatch. Timeouts are already logged by the comparator.
#[derive(Debug, Default)]
pub struct LogSink;

impl VerdictSink for LogSink {
    fn record_verdict(&self, verdict: &Verdict) {
        if verdict.matched {
            tracing::info!(
                request_id = %verdict.request_id,
                method = %verdict.method,
                path = %verdict.path,
                primary_ms = verdict.primary.elapsed_ms(),
                candidate_ms = verdict.candidate.elapsed_ms(),
                "SUCCESS: responses match"
            );
            return;
        }
        let reasons = verdict
            .reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!(
            request_id = %verdict.request_id,
            method = %verdict.method,
            path = %verdict.path,
            %reasons,
            primary_status = %side_status(&verdict.primary),
            candidate_status = %side_status(&verdict.candidate),
            primary_body = %side_body(&verdict.primary),
            candidate_body = %side_body(&verdict.candidate),
            "ERROR: responses do not match"
        );
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonlEvent<'a> {
    Verdict(&'a VerdictRecord),
    Timeout(&'a TimeoutNotice),
}

/// Appends verdicts and timeouts as JSON lines through a bounded queue and a
/// background writer. A full queue drops the line rather than block the
/// comparator.
pub struct JsonlSink {
    tx: mpsc::Sender<String>,
}

impl JsonlSink {
    /// Starts the writer task. It exits once the sink is dropped and the
    /// queue is drained.
    pub fn spawn(path: PathBuf, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(16));
        let handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let mut batch = vec![line];
                while batch.len() < JSONL_FLUSH_BATCH {
                    match rx.try_recv() {
                        Ok(next) => batch.push(next),
                        Err(_) => break,
                    }
                }
                let path = path.clone();
                match tokio::task::spawn_blocking(move || append_lines(&path, &batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(?err, "verdict jsonl write failed"),
                    Err(err) => tracing::warn!(?err, "verdict jsonl writer task failed"),
                }
            }
        });
        (Self { tx }, handle)
    }

    fn push(&self, event: JsonlEvent<'_>) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(?err, "verdict record not serializable");
                return;
            }
        };
        match self.tx.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("sink.jsonl_dropped").increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("verdict jsonl writer closed; line dropped");
            }
        }
    }
}

impl VerdictSink for JsonlSink {
    fn record_verdict(&self, verdict: &Verdict) {
        let record = VerdictRecord::from(verdict);
        self.push(JsonlEvent::Verdict(&record));
    }

    fn record_timeout(&self, notice: &TimeoutNotice) {
        self.push(JsonlEvent::Timeout(notice));
    }
}

fn append_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct VerdictStatsSnapshot {
    pub matched: u64,
    pub mismatched: u64,
    pub timed_out: u64,
    pub skipped_saturated: u64,
    pub primary_only: u64,
    pub status_differs: u64,
    pub body_differs: u64,
    pub side_failed: u64,
    pub match_ratio: f64,
    pub last_mismatch: Option<VerdictRecord>,
}

/// Running totals behind `/report/verdicts`.
#[derive(Debug, Default)]
pub struct StatsSink {
    matched: AtomicU64,
    mismatched: AtomicU64,
    timed_out: AtomicU64,
    skipped_saturated: AtomicU64,
    primary_only: AtomicU64,
    status_differs: AtomicU64,
    body_differs: AtomicU64,
    side_failed: AtomicU64,
    last_mismatch: RwLock<Option<VerdictRecord>>,
}

impl StatsSink {
    pub fn note_primary_only(&self) {
        self.primary_only.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_skipped(&self) {
        self.skipped_saturated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VerdictStatsSnapshot {
        let matched = self.matched.load(Ordering::Relaxed);
        let mismatched = self.mismatched.load(Ordering::Relaxed);
        let judged = matched + mismatched;
        VerdictStatsSnapshot {
            matched,
            mismatched,
            timed_out: self.timed_out.load(Ordering::Relaxed),
            skipped_saturated: self.skipped_saturated.load(Ordering::Relaxed),
            primary_only: self.primary_only.load(Ordering::Relaxed),
            status_differs: self.status_differs.load(Ordering::Relaxed),
            body_differs: self.body_differs.load(Ordering::Relaxed),
            side_failed: self.side_failed.load(Ordering::Relaxed),
            match_ratio: if judged == 0 {
                0.0
            } else {
                matched as f64 / judged as f64
            },
            last_mismatch: self.last_mismatch.read().clone(),
        }
    }
}

impl VerdictSink for StatsSink {
    fn record_verdict(&self, verdict: &Verdict) {
        if verdict.matched {
            self.matched.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.mismatched.fetch_add(1, Ordering::Relaxed);
        for reason in &verdict.reasons {
            let bucket = match reason.label() {
                "status_differs" => &self.status_differs,
                "body_differs" => &self.body_differs,
                _ => &self.side_failed,
            };
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_mismatch.write() = Some(VerdictRecord::from(verdict));
    }

    fn record_timeout(&self, _notice: &TimeoutNotice) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }
}
