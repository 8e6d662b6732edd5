use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Primary,
    Candidate,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Primary => "primary",
            Self::Candidate => "candidate",
        };
        f.write_str(value)
    }
}

/// Where a backend call stopped when it did not complete a round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Construction,
    Transport,
    BodyRead,
    /// The call was dropped at the comparison deadline.
    Cancelled,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Construction => "construction",
            Self::Transport => "transport",
            Self::BodyRead => "body_read",
            Self::Cancelled => "cancelled",
        };
        f.write_str(value)
    }
}

/// A request as received by the proxy, with the proxy prefix already removed
/// from `path`. Shared read-only between the primary and shadow paths.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: String,
    pub method: Method,
    /// Backend-relative path including the query string, e.g. `/route1/1?x=2`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            id: new_id(),
            method,
            path: path.into(),
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Delivered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Failed {
        stage: FailureStage,
        detail: String,
    },
}

/// The result of calling one backend once for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub source: Source,
    pub elapsed: Duration,
    pub kind: OutcomeKind,
}

impl Outcome {
    pub fn delivered(
        source: Source,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        elapsed: Duration,
    ) -> Self {
        Self {
            source,
            elapsed,
            kind: OutcomeKind::Delivered {
                status,
                headers,
                body,
            },
        }
    }

    pub fn failed(
        source: Source,
        stage: FailureStage,
        detail: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            source,
            elapsed,
            kind: OutcomeKind::Failed {
                stage,
                detail: detail.into(),
            },
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.kind {
            OutcomeKind::Delivered { status, .. } => Some(*status),
            OutcomeKind::Failed { .. } => None,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match &self.kind {
            OutcomeKind::Delivered { body, .. } => Some(body),
            OutcomeKind::Failed { .. } => None,
        }
    }

    pub fn failure_stage(&self) -> Option<FailureStage> {
        match &self.kind {
            OutcomeKind::Delivered { .. } => None,
            OutcomeKind::Failed { stage, .. } => Some(*stage),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchReason {
    StatusDiffers { primary: u16, candidate: u16 },
    BodyDiffers,
    SideFailed { source: Source, stage: FailureStage },
}

impl MismatchReason {
    /// Stable label used for metrics and stats buckets.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StatusDiffers { .. } => "status_differs",
            Self::BodyDiffers => "body_differs",
            Self::SideFailed { .. } => "side_failed",
        }
    }
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusDiffers { primary, candidate } => {
                write!(f, "status differs ({primary} vs {candidate})")
            }
            Self::BodyDiffers => f.write_str("body differs"),
            Self::SideFailed { source, stage } => write!(f, "{source} failed at {stage} stage"),
        }
    }
}

/// Pass/fail determination for one request. Terminal: handed to the sinks
/// and then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub matched: bool,
    pub reasons: Vec<MismatchReason>,
    pub primary: Outcome,
    pub candidate: Outcome,
}

/// Emitted instead of a verdict when one or both sides never reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutNotice {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub waited_ms: u64,
    pub missing: Vec<Source>,
}

pub trait VerdictSink: Send + Sync {
    fn record_verdict(&self, verdict: &Verdict);

    fn record_timeout(&self, notice: &TimeoutNotice) {
        let _ = notice;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SideRecord {
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<FailureStage>,
    pub elapsed_ms: f64,
    /// Only populated on mismatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl SideRecord {
    fn from_outcome(outcome: &Outcome, with_body: bool) -> Self {
        Self {
            source: outcome.source,
            status: outcome.status().map(|s| s.as_u16()),
            failed_stage: outcome.failure_stage(),
            elapsed_ms: outcome.elapsed_ms(),
            body: if with_body {
                outcome
                    .body()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
            } else {
                None
            },
        }
    }
}

/// Serialisable projection of a [`Verdict`] for sinks that persist or ship it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerdictRecord {
    pub ts_ms: i64,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub matched: bool,
    #[serde(default)]
    pub reasons: Vec<MismatchReason>,
    pub primary: SideRecord,
    pub candidate: SideRecord,
}

impl From<&Verdict> for VerdictRecord {
    fn from(verdict: &Verdict) -> Self {
        let with_body = !verdict.matched;
        Self {
            ts_ms: Utc::now().timestamp_millis(),
            request_id: verdict.request_id.clone(),
            method: verdict.method.to_string(),
            path: verdict.path.clone(),
            matched: verdict.matched,
            reasons: verdict.reasons.clone(),
            primary: SideRecord::from_outcome(&verdict.primary, with_body),
            candidate: SideRecord::from_outcome(&verdict.candidate, with_body),
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(source: Source, status: u16, body: &'static str, ms: u64) -> Outcome {
        Outcome::delivered(
            source,
            StatusCode::from_u16(status).expect("status"),
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
            Duration::from_millis(ms),
        )
    }

    #[test]
    fn reason_display() {
        assert_eq!(
            MismatchReason::StatusDiffers {
                primary: 200,
                candidate: 500
            }
            .to_string(),
            "status differs (200 vs 500)"
        );
        assert_eq!(
            MismatchReason::SideFailed {
                source: Source::Candidate,
                stage: FailureStage::Transport
            }
            .to_string(),
            "candidate failed at transport stage"
        );
    }

    #[test]
    fn failed_outcome_has_no_body() {
        let outcome = Outcome::failed(
            Source::Primary,
            FailureStage::BodyRead,
            "stream reset",
            Duration::from_millis(3),
        );
        assert!(outcome.body().is_none());
        assert!(outcome.status().is_none());
        assert_eq!(outcome.failure_stage(), Some(FailureStage::BodyRead));
    }

    #[test]
    fn record_carries_bodies_only_on_mismatch() {
        let primary = delivered(Source::Primary, 200, r#"{"id":"1"}"#, 1_000);
        let candidate = delivered(Source::Candidate, 200, r#"{"id":"1-typo"}"#, 29);
        let mut verdict = Verdict {
            request_id: "r1".to_string(),
            method: Method::GET,
            path: "/route1/1".to_string(),
            matched: false,
            reasons: vec![MismatchReason::BodyDiffers],
            primary,
            candidate,
        };

        let record = VerdictRecord::from(&verdict);
        assert_eq!(record.primary.body.as_deref(), Some(r#"{"id":"1"}"#));
        assert_eq!(record.candidate.body.as_deref(), Some(r#"{"id":"1-typo"}"#));

        verdict.matched = true;
        verdict.reasons.clear();
        let record = VerdictRecord::from(&verdict);
        assert!(record.primary.body.is_none());
        assert!(record.candidate.body.is_none());
        assert_eq!(record.primary.status, Some(200));
    }

    #[test]
    fn verdict_record_json_shape() {
        let verdict = Verdict {
            request_id: "r2".to_string(),
            method: Method::OPTIONS,
            path: "/x".to_string(),
            matched: false,
            reasons: vec![MismatchReason::SideFailed {
                source: Source::Candidate,
                stage: FailureStage::Transport,
            }],
            primary: delivered(Source::Primary, 204, "", 5),
            candidate: Outcome::failed(
                Source::Candidate,
                FailureStage::Transport,
                "connection refused",
                Duration::from_millis(1),
            ),
        };
        let raw = serde_json::to_value(VerdictRecord::from(&verdict)).expect("serialize");
        assert_eq!(raw["method"], "OPTIONS");
        assert_eq!(raw["reasons"][0]["kind"], "side_failed");
        assert_eq!(raw["reasons"][0]["source"], "candidate");
        assert_eq!(raw["candidate"]["failed_stage"], "transport");
        assert!(raw["candidate"].get("status").is_none());
    }
}
