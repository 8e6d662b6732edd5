pub mod bootstrap;
pub mod config_loader;
pub mod control_api;
pub mod dispatcher;
pub mod engine;
pub mod forwarder;
pub mod sinks;


use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::engine::ProxyEngine;
use crate::sinks::StatsSink;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub stats: Arc<StatsSink>,
    pub prometheus: Option<PrometheusHandle>,
    pub path_prefix: Arc<str>,
}

impl AppState {
    pub fn new(
        engine: ProxyEngine,
        stats: Arc<StatsSink>,
        prometheus: Option<PrometheusHandle>,
        path_prefix: &str,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            stats,
            prometheus,
            path_prefix: Arc::from(path_prefix),
        }
    }
}
