use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use core_types::InboundRequest;
use serde::Serialize;

use crate::sinks::VerdictStatsSnapshot;
use crate::AppState;

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    path_prefix: String,
    eligible_methods: Vec<String>,
    comparison_permits_available: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/report/verdicts", get(report_verdicts))
        .fallback(proxy)
        // Bodies are relayed as-is; size policy belongs to the backends.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(HealthResp {
        status: "ok",
        path_prefix: state.path_prefix.to_string(),
        eligible_methods: state
            .engine
            .eligible_methods()
            .iter()
            .map(ToString::to_string)
            .collect(),
        comparison_permits_available: state.engine.available_comparison_permits(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn report_verdicts(State(state): State<AppState>) -> Json<VerdictStatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(path) = strip_prefix(&state.path_prefix, uri.path()) else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    let path = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let request = InboundRequest::new(method, path, headers, body);
    tracing::debug!(
        request_id = %request.id,
        method = %request.method,
        path = %request.path,
        "proxying request"
    );
    state.engine.handle(request).await
}

/// Backend-relative remainder of `path` under `prefix`, or `None` when the
/// path is outside it. `/proxy-api2` is not under `/proxy-api`.
pub fn strip_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_whole_prefix_segments() {
        assert_eq!(strip_prefix("/proxy-api", "/proxy-api/route1/1"), Some("/route1/1"));
        assert_eq!(strip_prefix("/proxy-api", "/proxy-api"), Some(""));
        assert_eq!(strip_prefix("/proxy-api", "/proxy-api2/x"), None);
        assert_eq!(strip_prefix("/proxy-api", "/elsewhere"), None);
        assert_eq!(strip_prefix("", "/route1/1"), Some("/route1/1"));
    }
}
