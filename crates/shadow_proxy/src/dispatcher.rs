use std::sync::Arc;

use backend_caller::BackendCaller;
use comparator::OutcomeSender;
use core_types::{InboundRequest, Source};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Mirrors requests to the candidate backend off the caller's path.
#[derive(Clone)]
pub struct ShadowDispatcher {
    caller: BackendCaller,
    base_url: Arc<str>,
}

impl ShadowDispatcher {
    pub fn new(caller: BackendCaller, base_url: &str) -> Self {
        Self {
            caller,
            base_url: Arc::from(base_url),
        }
    }

    /// Calls the candidate, bounded by the comparison `deadline`, and delivers
    /// the outcome to `slot`. Failures only ever surface as a failed outcome.
    pub async fn dispatch(&self, request: &InboundRequest, slot: OutcomeSender, deadline: Instant) {
        let outcome = self
            .caller
            .call(Source::Candidate, &self.base_url, request, Some(deadline))
            .await;
        tracing::debug!(
            request_id = %request.id,
            status = ?outcome.status(),
            failed = ?outcome.failure_stage(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "candidate call finished"
        );
        slot.deliver(outcome);
    }

    pub fn spawn(
        &self,
        request: Arc<InboundRequest>,
        slot: OutcomeSender,
        deadline: Instant,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.dispatch(&request, slot, deadline).await })
    }
}
