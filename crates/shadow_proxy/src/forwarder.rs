use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use backend_caller::{strip_hop_by_hop, BackendCaller};
use comparator::OutcomeSender;
use core_types::{FailureStage, InboundRequest, Outcome, OutcomeKind, Source};
use http::StatusCode;

/// Owns the caller-facing side: every request gets exactly one terminal
/// response built from the primary backend's outcome.
#[derive(Clone)]
pub struct PrimaryForwarder {
    caller: BackendCaller,
    base_url: Arc<str>,
}

impl PrimaryForwarder {
    pub fn new(caller: BackendCaller, base_url: &str) -> Self {
        Self {
            caller,
            base_url: Arc::from(base_url),
        }
    }

    /// Calls the primary, builds the caller response and then hands the same
    /// outcome to `slot` if a comparison is waiting for it. Delivery never
    /// blocks, so the comparison cannot delay the response.
    pub async fn forward(&self, request: &InboundRequest, slot: Option<OutcomeSender>) -> Response {
        let outcome = self
            .caller
            .call(Source::Primary, &self.base_url, request, None)
            .await;
        let response = caller_response(&outcome);
        if let Some(slot) = slot {
            slot.deliver(outcome);
        }
        response
    }
}

/// Status and plain-text body returned to the caller when the primary call
/// did not complete.
pub fn failure_response(stage: FailureStage) -> (StatusCode, &'static str) {
    match stage {
        FailureStage::Construction => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create request"),
        FailureStage::Transport => (StatusCode::BAD_GATEWAY, "Failed to reach backend"),
        FailureStage::BodyRead => (StatusCode::SERVICE_UNAVAILABLE, "Failed to read backend body"),
        FailureStage::Cancelled => (StatusCode::GATEWAY_TIMEOUT, "Backend call cancelled"),
    }
}

/// Mirrors a delivered outcome to the caller. The body shares the buffer the
/// comparison sees, so both are byte-identical.
pub fn caller_response(outcome: &Outcome) -> Response {
    match &outcome.kind {
        OutcomeKind::Delivered {
            status,
            headers,
            body,
        } => {
            let mut headers = headers.clone();
            strip_hop_by_hop(&mut headers);

            let mut response = Response::new(Body::from(body.clone()));
            *response.status_mut() = *status;
            *response.headers_mut() = headers;
            response
        }
        OutcomeKind::Failed { stage, .. } => failure_response(*stage).into_response(),
    }
}
