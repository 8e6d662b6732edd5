use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Crates whose events the service logs at `info` unless told otherwise.
const PROXY_TARGETS: [&str; 3] = ["backend_caller", "comparator", "core_types"];

/// Default directives: `info` for the service and proxy crates, `warn` for
/// everything else (hyper and reqwest are chatty at `info`).
pub fn default_directives(service_name: &str) -> String {
    let mut directives = vec!["warn".to_string(), format!("{service_name}=info")];
    directives.extend(PROXY_TARGETS.iter().map(|t| format!("{t}=info")));
    directives.join(",")
}

/// Picks the filter source: `explicit` directives, then `RUST_LOG`, then
/// [`default_directives`]. Unparsable directives fall through to the next
/// source.
pub fn tracing_filter(service_name: &str, explicit: Option<&str>) -> EnvFilter {
    explicit
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(service_name)))
}

/// Installs the fmt subscriber behind a non-blocking stdout writer. Request
/// events carry their ids as fields, so thread ids are left out. The returned
/// guard flushes pending lines on drop and must outlive the server.
pub fn init_tracing(
    service_name: &str,
    explicit: Option<&str>,
) -> tracing_appender::non_blocking::WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let installed = tracing_subscriber::fmt()
        .with_env_filter(tracing_filter(service_name, explicit))
        .with_writer(writer)
        .with_target(true)
        .try_init()
        .is_ok();
    if !installed {
        eprintln!("{service_name}: tracing subscriber already installed");
    }
    guard
}

/// Installs the global prometheus recorder once; later calls return the same
/// handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_proxy_metrics();

    Ok(PROM_HANDLE.get_or_init(|| handle).clone())
}

fn describe_proxy_metrics() {
    describe_counter!(
        "proxy.requests",
        "Inbound requests by mode (shadowed, primary_only, skipped)"
    );
    describe_counter!("compare.matched", "Verdicts where both backends agreed");
    describe_counter!("compare.mismatched", "Verdicts where the backends disagreed");
    describe_counter!(
        "compare.timed_out",
        "Comparisons abandoned at the deadline without a verdict"
    );
    describe_counter!(
        "compare.abandoned",
        "Comparisons whose producers went away without reporting"
    );
    describe_counter!(
        "compare.protocol_violation",
        "Outcomes delivered twice for the same source"
    );
    describe_counter!("backend.failed", "Backend calls that failed, by source and stage");
    describe_counter!("sink.jsonl_dropped", "Verdict records dropped on a full JSONL queue");
    describe_histogram!(
        "backend.elapsed_ms",
        Unit::Milliseconds,
        "Backend call duration by source"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cover_service_and_proxy_crates() {
        assert_eq!(
            default_directives("shadow_proxy"),
            "warn,shadow_proxy=info,backend_caller=info,comparator=info,core_types=info"
        );
    }

    #[test]
    fn explicit_directives_win() {
        let filter = tracing_filter("shadow_proxy", Some("comparator=debug"));
        assert_eq!(filter.to_string(), "comparator=debug");
    }

    #[test]
    fn unparsable_explicit_directives_fall_back() {
        let filter = tracing_filter("shadow_proxy", Some("comparator=[loud"));
        assert_ne!(filter.to_string(), "comparator=[loud");
    }
}
