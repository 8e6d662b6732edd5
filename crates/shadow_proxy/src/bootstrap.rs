use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use backend_caller::BackendCaller;
use clap::Parser;
use core_types::VerdictSink;
use metrics_exporter_prometheus::PrometheusHandle;
use observability::{init_metrics, init_tracing};
use reqwest::Client;
use tokio::task::JoinHandle;

use crate::config_loader::{load_proxy_config, ProxyConfig, DEFAULT_CONFIG_PATH};
use crate::control_api::build_router;
use crate::engine::ProxyEngine;
use crate::sinks::{JsonlSink, LogSink, SinkSet, StatsSink};
use crate::AppState;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "shadow-proxy",
    about = "Serves callers from the primary backend and compares a candidate in the shadow",
    version
)]
pub struct Cli {
    #[arg(long, env = "SHADOW_PROXY_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// Tracing directives; takes precedence over `RUST_LOG`.
    #[arg(long, env = "SHADOW_PROXY_LOG")]
    pub log_filter: Option<String>,
    #[arg(long, env = "SHADOW_PROXY_PRIMARY_BASE_URL")]
    pub primary_base_url: Option<String>,
    #[arg(long, env = "SHADOW_PROXY_CANDIDATE_BASE_URL")]
    pub candidate_base_url: Option<String>,
    #[arg(long, env = "SHADOW_PROXY_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,
    #[arg(long, env = "SHADOW_PROXY_PATH_PREFIX")]
    pub path_prefix: Option<String>,
    #[arg(long, env = "SHADOW_PROXY_COMPARISON_TIMEOUT_MS")]
    pub comparison_timeout_ms: Option<u64>,
    /// Comma separated, e.g. `GET,OPTIONS`.
    #[arg(long, env = "SHADOW_PROXY_ELIGIBLE_METHODS", value_delimiter = ',')]
    pub comparison_eligible_methods: Option<Vec<String>>,
    #[arg(long, env = "SHADOW_PROXY_MAX_INFLIGHT_COMPARISONS")]
    pub max_inflight_comparisons: Option<usize>,
    #[arg(long, env = "SHADOW_PROXY_VERDICT_LOG_PATH")]
    pub verdict_log_path: Option<PathBuf>,
}

impl Cli {
    /// Flags and environment win over the config file.
    pub fn apply(&self, cfg: &mut ProxyConfig) {
        if let Some(v) = &self.primary_base_url {
            cfg.primary_base_url = v.clone();
        }
        if let Some(v) = &self.candidate_base_url {
            cfg.candidate_base_url = v.clone();
        }
        if let Some(v) = &self.listen_address {
            cfg.listen_address = v.clone();
        }
        if let Some(v) = &self.path_prefix {
            cfg.path_prefix = v.clone();
        }
        if let Some(v) = self.comparison_timeout_ms {
            cfg.comparison_timeout_ms = v;
        }
        if let Some(v) = &self.comparison_eligible_methods {
            cfg.comparison_eligible_methods = v.clone();
        }
        if let Some(v) = self.max_inflight_comparisons {
            cfg.max_inflight_comparisons = v;
        }
        if let Some(v) = &self.verdict_log_path {
            cfg.verdict_log_path = Some(v.clone());
        }
    }
}

/// Everything the server needs, wired but not yet bound.
pub struct ProxyRuntime {
    pub state: AppState,
    pub jsonl_writer: Option<JoinHandle<()>>,
}

impl ProxyRuntime {
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Releases the shared state and waits up to `grace` for in-flight
    /// comparisons to publish and the JSONL writer to drain. Returns `false`
    /// if the writer was still busy when `grace` ran out.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let Self {
            state,
            jsonl_writer,
        } = self;
        drop(state);
        let Some(writer) = jsonl_writer else {
            return true;
        };
        match tokio::time::timeout(grace, writer).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(?err, "verdict jsonl writer task failed");
                true
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "verdict jsonl writer still busy at shutdown; pending lines lost"
                );
                false
            }
        }
    }
}

pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()
        .context("build backend http client")
}

/// Wires sinks, engine and shared state from a validated config. `extra`
/// sinks receive every resolution after the built-in ones.
pub fn assemble(
    cfg: &ProxyConfig,
    http: Client,
    prometheus: Option<PrometheusHandle>,
    extra: Vec<Arc<dyn VerdictSink>>,
) -> Result<ProxyRuntime> {
    let stats = Arc::new(StatsSink::default());
    let mut sinks = SinkSet::default();
    sinks.push(stats.clone());
    sinks.push(Arc::new(LogSink));

    let jsonl_writer = match &cfg.verdict_log_path {
        Some(path) => {
            let (sink, writer) = JsonlSink::spawn(path.clone(), cfg.jsonl_queue_capacity);
            sinks.push(Arc::new(sink));
            tracing::info!(path = %path.display(), "verdict jsonl sink enabled");
            Some(writer)
        }
        None => None,
    };
    for sink in extra {
        sinks.push(sink);
    }

    let engine = ProxyEngine::new(cfg, BackendCaller::new(http), sinks, stats.clone())
        .context("build proxy engine")?;
    Ok(ProxyRuntime {
        state: AppState::new(engine, stats, prometheus, &cfg.path_prefix),
        jsonl_writer,
    })
}

pub async fn run(cli: Cli) -> Result<()> {
    let _guard = init_tracing("shadow_proxy", cli.log_filter.as_deref());
    let prometheus = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(?err, "prometheus recorder unavailable; /metrics disabled");
            None
        }
    };

    let mut cfg = load_proxy_config(&cli.config)?;
    cli.apply(&mut cfg);
    let cfg = cfg.validated().context("invalid proxy config")?;

    let runtime = assemble(&cfg, build_http_client()?, prometheus, Vec::new())?;
    let app = runtime.router();

    let listener = tokio::net::TcpListener::bind(&cfg.listen_address)
        .await
        .with_context(|| format!("bind {}", cfg.listen_address))?;
    tracing::info!(
        addr = %cfg.listen_address,
        primary = %cfg.primary_base_url,
        candidate = %cfg.candidate_base_url,
        prefix = %cfg.path_prefix,
        timeout_ms = cfg.comparison_timeout_ms,
        eligible = ?cfg.comparison_eligible_methods,
        "shadow proxy started"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    // Comparisons in flight finish within their timeout; give them that long.
    let grace = cfg.comparison_timeout() + Duration::from_secs(1);
    runtime.shutdown(grace).await;
    tracing::info!("shadow proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "ctrl-c handler failed; shutting down");
    }
}
