use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use backend_caller::BackendCaller;
use comparator::rendezvous;
use core_types::InboundRequest;
use http::Method;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config_loader::{ConfigError, ProxyConfig};
use crate::dispatcher::ShadowDispatcher;
use crate::forwarder::PrimaryForwarder;
use crate::sinks::{SinkSet, StatsSink};

/// How a request was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Forwarded to the primary and mirrored to the candidate for comparison.
    Shadowed,
    /// Method not eligible for comparison.
    PrimaryOnly,
    /// Eligible, but the comparison limit was reached.
    Skipped,
}

impl RouteMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Shadowed => "shadowed",
            Self::PrimaryOnly => "primary_only",
            Self::Skipped => "skipped",
        }
    }
}

pub struct ProxyEngine {
    primary: PrimaryForwarder,
    shadow: ShadowDispatcher,
    eligible: Vec<Method>,
    comparison_timeout: Duration,
    limiter: Arc<Semaphore>,
    sinks: Arc<SinkSet>,
    stats: Arc<StatsSink>,
}

impl ProxyEngine {
    /// `stats` receives the routing counters; register it in `sinks` as well
    /// for verdict totals.
    pub fn new(
        cfg: &ProxyConfig,
        caller: BackendCaller,
        sinks: SinkSet,
        stats: Arc<StatsSink>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            primary: PrimaryForwarder::new(caller.clone(), &cfg.primary_base_url),
            shadow: ShadowDispatcher::new(caller, &cfg.candidate_base_url),
            eligible: cfg.eligible_methods()?,
            comparison_timeout: cfg.comparison_timeout(),
            limiter: Arc::new(Semaphore::new(cfg.max_inflight_comparisons)),
            sinks: Arc::new(sinks),
            stats,
        })
    }

    pub fn is_eligible(&self, method: &Method) -> bool {
        self.eligible.contains(method)
    }

    pub fn eligible_methods(&self) -> &[Method] {
        &self.eligible
    }

    pub fn available_comparison_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Answers the caller from the primary. Eligible requests additionally
    /// start a candidate call and a comparator on their own tasks; the
    /// response never waits on either.
    pub async fn handle(&self, request: InboundRequest) -> Response {
        if !self.is_eligible(&request.method) {
            count_route(RouteMode::PrimaryOnly);
            self.stats.note_primary_only();
            return self.primary.forward(&request, None).await;
        }
        let Ok(permit) = self.limiter.clone().try_acquire_owned() else {
            count_route(RouteMode::Skipped);
            self.stats.note_skipped();
            tracing::debug!(
                request_id = %request.id,
                "comparison limit reached; forwarding to primary only"
            );
            return self.primary.forward(&request, None).await;
        };
        count_route(RouteMode::Shadowed);

        let request = Arc::new(request);
        let deadline = Instant::now() + self.comparison_timeout;
        let (primary_slot, candidate_slot, comparator) = rendezvous(&request);

        let sinks = Arc::clone(&self.sinks);
        tokio::spawn(async move {
            let resolution = comparator.run(deadline).await;
            sinks.publish(&resolution);
            drop(permit);
        });
        self.shadow.spawn(request.clone(), candidate_slot, deadline);

        self.primary.forward(&request, Some(primary_slot)).await
    }
}

fn count_route(mode: RouteMode) {
    metrics::counter!("proxy.requests", "mode" => mode.as_str()).increment(1);
}
