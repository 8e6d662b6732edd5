//! Per-request rendezvous between the primary and candidate outcomes.
//!
//! [`rendezvous`] hands out one single-use [`OutcomeSender`] per source and a
//! [`Comparator`] that waits for both, bounded by a deadline. The comparator
//! resolves exactly once: into a [`Verdict`] when both slots are filled, or
//! into a [`TimeoutNotice`] when the deadline passes or both producers go away
//! first.

use core_types::{InboundRequest, MismatchReason, Outcome, Source, TimeoutNotice, Verdict};
use http::Method;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout_at, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Empty,
    Filled(Outcome),
}

impl Slot {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled(_))
    }

    /// Fills an empty slot. A filled slot keeps its first outcome and the
    /// rejected one is handed back.
    fn fill(&mut self, outcome: Outcome) -> Result<(), Outcome> {
        match self {
            Self::Empty => {
                *self = Self::Filled(outcome);
                Ok(())
            }
            Self::Filled(_) => Err(outcome),
        }
    }

    fn take(&mut self) -> Option<Outcome> {
        match std::mem::replace(self, Self::Empty) {
            Self::Filled(outcome) => Some(outcome),
            Self::Empty => None,
        }
    }
}

/// Producer half of the handoff for one source. Consumed by delivery, so each
/// source can report at most once through it.
#[derive(Debug)]
pub struct OutcomeSender {
    source: Source,
    request_id: String,
    tx: mpsc::Sender<Outcome>,
}

impl OutcomeSender {
    pub fn source(&self) -> Source {
        self.source
    }

    /// Hands the outcome to the comparator without waiting. If the comparator
    /// already resolved, the outcome is discarded.
    pub fn deliver(self, outcome: Outcome) {
        if outcome.source != self.source {
            tracing::warn!(
                request_id = %self.request_id,
                expected = %self.source,
                got = %outcome.source,
                "outcome delivered through the wrong slot"
            );
        }
        match self.tx.try_send(outcome) {
            Ok(()) => {}
            Err(TrySendError::Closed(outcome)) => {
                tracing::debug!(
                    request_id = %self.request_id,
                    source = %outcome.source,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "comparison already resolved; late outcome discarded"
                );
            }
            Err(TrySendError::Full(outcome)) => {
                metrics::counter!("compare.protocol_violation").increment(1);
                tracing::warn!(
                    request_id = %self.request_id,
                    source = %outcome.source,
                    "handoff full; outcome discarded"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Complete(Verdict),
    /// The deadline passed before both outcomes arrived.
    TimedOut(TimeoutNotice),
    /// Every producer dropped its sender before both outcomes arrived.
    Abandoned(TimeoutNotice),
}

/// Consumer half of the handoff, scoped to one request.
#[derive(Debug)]
pub struct Comparator {
    request_id: String,
    method: Method,
    path: String,
    rx: mpsc::Receiver<Outcome>,
    primary: Slot,
    candidate: Slot,
}

/// Creates the two-slot handoff for `request`: (primary sender, candidate
/// sender, comparator).
pub fn rendezvous(request: &InboundRequest) -> (OutcomeSender, OutcomeSender, Comparator) {
    let (tx, rx) = mpsc::channel(2);
    let primary = OutcomeSender {
        source: Source::Primary,
        request_id: request.id.clone(),
        tx: tx.clone(),
    };
    let candidate = OutcomeSender {
        source: Source::Candidate,
        request_id: request.id.clone(),
        tx,
    };
    let comparator = Comparator {
        request_id: request.id.clone(),
        method: request.method.clone(),
        path: request.path.clone(),
        rx,
        primary: Slot::Empty,
        candidate: Slot::Empty,
    };
    (primary, candidate, comparator)
}

impl Comparator {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_complete(&self) -> bool {
        self.primary.is_filled() && self.candidate.is_filled()
    }

    /// Records `outcome` in the slot of its source. Returns `false` when the
    /// slot was already filled; the first outcome is kept.
    pub fn offer(&mut self, outcome: Outcome) -> bool {
        let source = outcome.source;
        let slot = match source {
            Source::Primary => &mut self.primary,
            Source::Candidate => &mut self.candidate,
        };
        match slot.fill(outcome) {
            Ok(()) => true,
            Err(rejected) => {
                metrics::counter!("compare.protocol_violation").increment(1);
                tracing::warn!(
                    request_id = %self.request_id,
                    %source,
                    elapsed_ms = rejected.elapsed.as_millis() as u64,
                    "second outcome for an already reported source ignored"
                );
                false
            }
        }
    }

    /// Waits for both outcomes until `deadline` and resolves. Anything
    /// received at or past the deadline counts as a timeout, including the
    /// candidate's own cancellation.
    pub async fn run(mut self, deadline: Instant) -> Resolution {
        let started = Instant::now();
        let (primary, candidate) = loop {
            if self.is_complete() {
                if let (Some(p), Some(c)) = (self.primary.take(), self.candidate.take()) {
                    break (p, c);
                }
            }
            let received = timeout_at(deadline, self.rx.recv()).await;
            let in_time = Instant::now() < deadline;
            match received {
                Ok(Some(outcome)) if in_time => {
                    self.offer(outcome);
                }
                Ok(None) if in_time => {
                    let notice = self.notice(started);
                    metrics::counter!("compare.abandoned").increment(1);
                    tracing::warn!(
                        request_id = %notice.request_id,
                        missing = ?notice.missing,
                        "comparison abandoned: producers gone before reporting"
                    );
                    return Resolution::Abandoned(notice);
                }
                _ => {
                    let notice = self.notice(started);
                    metrics::counter!("compare.timed_out").increment(1);
                    tracing::warn!(
                        request_id = %notice.request_id,
                        waited_ms = notice.waited_ms,
                        missing = ?notice.missing,
                        "comparison timed out: not measuring request"
                    );
                    return Resolution::TimedOut(notice);
                }
            }
        };
        self.rx.close();

        let verdict = judge(self.request_id, self.method, self.path, primary, candidate);
        if verdict.matched {
            metrics::counter!("compare.matched").increment(1);
        } else {
            metrics::counter!("compare.mismatched").increment(1);
        }
        Resolution::Complete(verdict)
    }

    fn notice(&self, started: Instant) -> TimeoutNotice {
        let mut missing = Vec::new();
        if !self.primary.is_filled() {
            missing.push(Source::Primary);
        }
        if !self.candidate.is_filled() {
            missing.push(Source::Candidate);
        }
        TimeoutNotice {
            request_id: self.request_id.clone(),
            method: self.method.to_string(),
            path: self.path.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
            missing,
        }
    }
}

/// Mismatch reasons between two outcomes; empty means they match. Status and
/// body are compared byte-exact, headers are not compared.
pub fn mismatch_reasons(primary: &Outcome, candidate: &Outcome) -> Vec<MismatchReason> {
    let mut reasons = Vec::new();
    for side in [primary, candidate] {
        if let Some(stage) = side.failure_stage() {
            reasons.push(MismatchReason::SideFailed {
                source: side.source,
                stage,
            });
        }
    }
    if let (Some(p), Some(c)) = (primary.status(), candidate.status()) {
        if p != c {
            reasons.push(MismatchReason::StatusDiffers {
                primary: p.as_u16(),
                candidate: c.as_u16(),
            });
        }
    }
    if let (Some(p), Some(c)) = (primary.body(), candidate.body()) {
        if p != c {
            reasons.push(MismatchReason::BodyDiffers);
        }
    }
    reasons
}

pub fn judge(
    request_id: String,
    method: Method,
    path: String,
    primary: Outcome,
    candidate: Outcome,
) -> Verdict {
    let reasons = mismatch_reasons(&primary, &candidate);
    Verdict {
        request_id,
        method,
        path,
        matched: reasons.is_empty(),
        reasons,
        primary,
        candidate,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use core_types::FailureStage;
    use http::{HeaderMap, HeaderValue, StatusCode};

    use super::*;

    fn request() -> InboundRequest {
        InboundRequest::new(Method::GET, "/route1/1", HeaderMap::new(), Bytes::new())
    }

    fn delivered(source: Source, status: u16, body: &'static str, ms: u64) -> Outcome {
        Outcome::delivered(
            source,
            StatusCode::from_u16(status).expect("status"),
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
            Duration::from_millis(ms),
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn expect_verdict(resolution: Resolution) -> Verdict {
        match resolution {
            Resolution::Complete(verdict) => verdict,
            other => panic!("expected verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_responses_match_with_both_durations() {
        let (primary, candidate, comparator) = rendezvous(&request());
        primary.deliver(delivered(Source::Primary, 200, r#"{"id":"1"}"#, 1_000));
        candidate.deliver(delivered(Source::Candidate, 200, r#"{"id":"1"}"#, 29));

        let verdict = expect_verdict(comparator.run(deadline()).await);
        assert!(verdict.matched);
        assert!(verdict.reasons.is_empty());
        assert_eq!(verdict.primary.elapsed, Duration::from_millis(1_000));
        assert_eq!(verdict.candidate.elapsed, Duration::from_millis(29));
    }

    #[tokio::test]
    async fn body_difference_is_reported_with_both_bodies() {
        let (primary, candidate, comparator) = rendezvous(&request());
        primary.deliver(delivered(Source::Primary, 200, r#"{"id":"1"}"#, 5));
        candidate.deliver(delivered(Source::Candidate, 200, r#"{"id":"1-typo"}"#, 5));

        let verdict = expect_verdict(comparator.run(deadline()).await);
        assert!(!verdict.matched);
        assert_eq!(verdict.reasons, vec![MismatchReason::BodyDiffers]);
        assert_eq!(verdict.primary.body().map(|b| &b[..]), Some(&br#"{"id":"1"}"#[..]));
        assert_eq!(
            verdict.candidate.body().map(|b| &b[..]),
            Some(&br#"{"id":"1-typo"}"#[..])
        );
    }

    #[tokio::test]
    async fn status_difference_is_reported() {
        let (primary, candidate, comparator) = rendezvous(&request());
        primary.deliver(delivered(Source::Primary, 200, "ok", 5));
        candidate.deliver(delivered(Source::Candidate, 500, "ok", 5));

        let verdict = expect_verdict(comparator.run(deadline()).await);
        assert_eq!(
            verdict.reasons,
            vec![MismatchReason::StatusDiffers {
                primary: 200,
                candidate: 500
            }]
        );
    }

    #[tokio::test]
    async fn failed_candidate_names_side_and_stage() {
        let (primary, candidate, comparator) = rendezvous(&request());
        candidate.deliver(Outcome::failed(
            Source::Candidate,
            FailureStage::Transport,
            "connection refused",
            Duration::from_millis(1),
        ));
        primary.deliver(delivered(Source::Primary, 200, "ok", 5));

        let verdict = expect_verdict(comparator.run(deadline()).await);
        assert!(!verdict.matched);
        assert_eq!(
            verdict.reasons,
            vec![MismatchReason::SideFailed {
                source: Source::Candidate,
                stage: FailureStage::Transport
            }]
        );
    }

    #[test]
    fn headers_do_not_affect_the_verdict() {
        let mut headers = HeaderMap::new();
        headers.insert("x-served-by", HeaderValue::from_static("b"));
        let primary = delivered(Source::Primary, 200, "same", 1);
        let candidate = Outcome::delivered(
            Source::Candidate,
            StatusCode::OK,
            headers,
            Bytes::from_static(b"same"),
            Duration::from_millis(1),
        );
        assert!(mismatch_reasons(&primary, &candidate).is_empty());
    }

    #[tokio::test]
    async fn arrival_order_does_not_change_the_verdict() {
        let req = request();
        let p = delivered(Source::Primary, 200, "a", 3);
        let c = delivered(Source::Candidate, 404, "b", 4);

        let (tx_p, tx_c, first) = rendezvous(&req);
        tx_p.deliver(p.clone());
        tx_c.deliver(c.clone());
        let a = expect_verdict(first.run(deadline()).await);

        let (tx_p, tx_c, second) = rendezvous(&req);
        tx_c.deliver(c);
        tx_p.deliver(p);
        let b = expect_verdict(second.run(deadline()).await);

        assert_eq!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_candidate_times_out_without_verdict() {
        let (primary, candidate, comparator) = rendezvous(&request());
        primary.deliver(delivered(Source::Primary, 200, "ok", 5));

        let resolution = comparator
            .run(Instant::now() + Duration::from_secs(60))
            .await;

        match resolution {
            Resolution::TimedOut(notice) => {
                assert_eq!(notice.missing, vec![Source::Candidate]);
                assert!(notice.waited_ms >= 60_000);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        // The receiver is gone; a late outcome is dropped quietly.
        candidate.deliver(delivered(Source::Candidate, 200, "ok", 61_000));
    }

    #[tokio::test]
    async fn dropped_producers_abandon_the_comparison() {
        let (primary, candidate, comparator) = rendezvous(&request());
        primary.deliver(delivered(Source::Primary, 200, "ok", 5));
        drop(candidate);

        match comparator.run(deadline()).await {
            Resolution::Abandoned(notice) => assert_eq!(notice.missing, vec![Source::Candidate]),
            other => panic!("expected abandoned, got {other:?}"),
        }
    }

    #[test]
    fn second_outcome_for_a_source_is_ignored() {
        let (_p, _c, mut comparator) = rendezvous(&request());
        assert!(comparator.offer(delivered(Source::Primary, 200, "first", 1)));
        assert!(!comparator.offer(delivered(Source::Primary, 500, "second", 1)));
        assert!(!comparator.is_complete());
        assert_eq!(
            comparator.primary,
            Slot::Filled(delivered(Source::Primary, 200, "first", 1))
        );
    }
}
