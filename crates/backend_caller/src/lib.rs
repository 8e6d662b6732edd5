use bytes::Bytes;
use core_types::{FailureStage, InboundRequest, Outcome, Source};
use http::header::{self, HeaderMap, HeaderName};
use http::StatusCode;
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};

/// Headers that describe a single hop and must not be relayed by a proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum CallError {
    #[error("could not build request: {0}")]
    Construction(String),
    #[error("backend unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("could not read backend body: {0}")]
    BodyRead(#[source] reqwest::Error),
    #[error("call abandoned at comparison deadline")]
    Cancelled,
}

impl CallError {
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::Construction(_) => FailureStage::Construction,
            Self::Transport(_) => FailureStage::Transport,
            Self::BodyRead(_) => FailureStage::BodyRead,
            Self::Cancelled => FailureStage::Cancelled,
        }
    }
}

struct BackendResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Performs single buffered round trips against one backend at a time. Cheap
/// to clone; clones share the connection pool.
#[derive(Clone)]
pub struct BackendCaller {
    http: Client,
}

impl BackendCaller {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Calls `base_url` + `request.path` and captures the result as an
    /// [`Outcome`]. Never fails: every error becomes `OutcomeKind::Failed`
    /// with the elapsed time up to the failure.
    ///
    /// With a `deadline`, the whole exchange (send and body read) is dropped
    /// when it passes, which closes the underlying connection.
    pub async fn call(
        &self,
        source: Source,
        base_url: &str,
        request: &InboundRequest,
        deadline: Option<Instant>,
    ) -> Outcome {
        let started = Instant::now();
        let exchange = self.exchange(base_url, request);
        let result = match deadline {
            Some(deadline) => timeout_at(deadline, exchange)
                .await
                .unwrap_or(Err(CallError::Cancelled)),
            None => exchange.await,
        };
        let elapsed = started.elapsed();

        metrics::histogram!("backend.elapsed_ms", "source" => source.to_string())
            .record(elapsed.as_secs_f64() * 1_000.0);

        match result {
            Ok(res) => Outcome::delivered(source, res.status, res.headers, res.body, elapsed),
            Err(err) => {
                let stage = err.stage();
                metrics::counter!(
                    "backend.failed",
                    "source" => source.to_string(),
                    "stage" => stage.to_string()
                )
                .increment(1);
                tracing::warn!(
                    request_id = %request.id,
                    %source,
                    %stage,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "backend call failed"
                );
                Outcome::failed(source, stage, err.to_string(), elapsed)
            }
        }
    }

    async fn exchange(
        &self,
        base_url: &str,
        request: &InboundRequest,
    ) -> Result<BackendResponse, CallError> {
        let url = backend_url(base_url, &request.path)?;

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        let outbound = builder
            .build()
            .map_err(|err| CallError::Construction(err.to_string()))?;

        let res = self
            .http
            .execute(outbound)
            .await
            .map_err(CallError::Transport)?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.bytes().await.map_err(CallError::BodyRead)?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}

/// Joins a configured base URL and a backend-relative path by plain
/// concatenation, so `http://h/api1` + `/route1/1` gives `http://h/api1/route1/1`.
pub fn backend_url(base_url: &str, path: &str) -> Result<Url, CallError> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|err| CallError::Construction(format!("{joined}: {err}")))
}

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
