use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Method;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "configs/shadow_proxy.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{field} is not an http(s) url: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("path_prefix must be empty or start with '/': {0}")]
    InvalidPrefix(String),
    #[error("invalid http method in comparison_eligible_methods: {0}")]
    InvalidMethod(String),
    #[error("listen_address must not be empty")]
    EmptyListenAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    pub primary_base_url: String,
    pub candidate_base_url: String,
    pub listen_address: String,
    /// Stripped from inbound paths before building backend URLs.
    pub path_prefix: String,
    pub comparison_timeout_ms: u64,
    pub comparison_eligible_methods: Vec<String>,
    /// Upper bound on comparisons in flight; beyond it requests go to the
    /// primary only.
    pub max_inflight_comparisons: usize,
    pub verdict_log_path: Option<PathBuf>,
    pub jsonl_queue_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            primary_base_url: "http://localhost:8091/api1".to_string(),
            candidate_base_url: "http://localhost:8092/api2".to_string(),
            listen_address: "0.0.0.0:8080".to_string(),
            path_prefix: "/proxy-api".to_string(),
            comparison_timeout_ms: 60_000,
            comparison_eligible_methods: vec!["GET".to_string(), "OPTIONS".to_string()],
            max_inflight_comparisons: 256,
            verdict_log_path: None,
            jsonl_queue_capacity: 1_024,
        }
    }
}

impl ProxyConfig {
    pub fn comparison_timeout(&self) -> Duration {
        Duration::from_millis(self.comparison_timeout_ms)
    }

    pub fn eligible_methods(&self) -> Result<Vec<Method>, ConfigError> {
        self.comparison_eligible_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| ConfigError::InvalidMethod(m.clone()))
            })
            .collect()
    }

    /// Clamps numeric fields, trims the prefix and checks everything the
    /// proxy needs before it binds.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        check_base_url("primary_base_url", &self.primary_base_url)?;
        check_base_url("candidate_base_url", &self.candidate_base_url)?;

        let prefix = self.path_prefix.trim().trim_end_matches('/');
        if !prefix.is_empty() && !prefix.starts_with('/') {
            return Err(ConfigError::InvalidPrefix(self.path_prefix));
        }
        self.path_prefix = prefix.to_string();

        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddress);
        }
        self.eligible_methods()?;

        self.comparison_timeout_ms = self.comparison_timeout_ms.clamp(100, 3_600_000);
        self.max_inflight_comparisons = self.max_inflight_comparisons.clamp(1, 65_536);
        self.jsonl_queue_capacity = self.jsonl_queue_capacity.clamp(16, 1_048_576);
        Ok(self)
    }
}

fn check_base_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    };
    let url = Url::parse(value).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    Ok(())
}

/// Reads the `[proxy]` section of `path` over the defaults. A missing file
/// yields the defaults; an unreadable or malformed one is an error.
pub fn load_proxy_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            return Ok(ProxyConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_proxy_config(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_proxy_config(raw: &str) -> Result<ProxyConfig, toml::de::Error> {
    #[derive(Debug, Deserialize, Default)]
    struct ProxyFile {
        proxy: Option<ProxySection>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct ProxySection {
        primary_base_url: Option<String>,
        candidate_base_url: Option<String>,
        listen_address: Option<String>,
        path_prefix: Option<String>,
        comparison_timeout_ms: Option<u64>,
        comparison_eligible_methods: Option<Vec<String>>,
        max_inflight_comparisons: Option<usize>,
        verdict_log_path: Option<PathBuf>,
        jsonl_queue_capacity: Option<usize>,
    }

    let parsed = toml::from_str::<ProxyFile>(raw)?;
    let mut cfg = ProxyConfig::default();
    let Some(section) = parsed.proxy else {
        return Ok(cfg);
    };
    if let Some(v) = section.primary_base_url {
        cfg.primary_base_url = v;
    }
    if let Some(v) = section.candidate_base_url {
        cfg.candidate_base_url = v;
    }
    if let Some(v) = section.listen_address {
        cfg.listen_address = v;
    }
    if let Some(v) = section.path_prefix {
        cfg.path_prefix = v;
    }
    if let Some(v) = section.comparison_timeout_ms {
        cfg.comparison_timeout_ms = v;
    }
    if let Some(v) = section.comparison_eligible_methods {
        cfg.comparison_eligible_methods = v;
    }
    if let Some(v) = section.max_inflight_comparisons {
        cfg.max_inflight_comparisons = v;
    }
    if let Some(v) = section.verdict_log_path {
        cfg.verdict_log_path = (!v.as_os_str().is_empty()).then_some(v);
    }
    if let Some(v) = section.jsonl_queue_capacity {
        cfg.jsonl_queue_capacity = v;
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = ProxyConfig::default().validated().expect("valid");
        assert_eq!(cfg.primary_base_url, "http://localhost:8091/api1");
        assert_eq!(cfg.candidate_base_url, "http://localhost:8092/api2");
        assert_eq!(cfg.path_prefix, "/proxy-api");
        assert_eq!(cfg.comparison_timeout(), Duration::from_secs(60));
        assert_eq!(
            cfg.eligible_methods().expect("methods"),
            vec![Method::GET, Method::OPTIONS]
        );
    }

    #[test]
    fn section_overrides_defaults() {
        let raw = r#"
            [proxy]
            primary_base_url = "http://a.internal/v1"
            candidate_base_url = "https://b.internal/v1"
            path_prefix = "/shadow/"
            comparison_timeout_ms = 5000
            comparison_eligible_methods = ["get", "HEAD"]
            verdict_log_path = "datasets/verdicts.jsonl"
        "#;
        let cfg = parse_proxy_config(raw)
            .expect("parse")
            .validated()
            .expect("valid");
        assert_eq!(cfg.primary_base_url, "http://a.internal/v1");
        assert_eq!(cfg.path_prefix, "/shadow");
        assert_eq!(cfg.comparison_timeout_ms, 5_000);
        assert_eq!(
            cfg.eligible_methods().expect("methods"),
            vec![Method::GET, Method::HEAD]
        );
        assert_eq!(
            cfg.verdict_log_path.as_deref(),
            Some(Path::new("datasets/verdicts.jsonl"))
        );
        assert_eq!(cfg.listen_address, "0.0.0.0:8080");
    }

    #[test]
    fn missing_section_is_default() {
        let cfg = parse_proxy_config("[other]\nx = 1\n").expect("parse");
        assert_eq!(cfg, ProxyConfig::default());
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(parse_proxy_config("[proxy]\ncomparison_timeout = 5\n").is_err());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = ProxyConfig {
            comparison_timeout_ms: 1,
            max_inflight_comparisons: 0,
            ..ProxyConfig::default()
        }
        .validated()
        .expect("valid");
        assert_eq!(cfg.comparison_timeout_ms, 100);
        assert_eq!(cfg.max_inflight_comparisons, 1);
    }

    #[test]
    fn rejects_bad_urls_prefixes_and_methods() {
        let bad_url = ProxyConfig {
            candidate_base_url: "ftp://b/api2".to_string(),
            ..ProxyConfig::default()
        };
        assert!(matches!(
            bad_url.validated(),
            Err(ConfigError::InvalidUrl {
                field: "candidate_base_url",
                ..
            })
        ));

        let bad_prefix = ProxyConfig {
            path_prefix: "proxy-api".to_string(),
            ..ProxyConfig::default()
        };
        assert!(matches!(
            bad_prefix.validated(),
            Err(ConfigError::InvalidPrefix(_))
        ));

        let bad_method = ProxyConfig {
            comparison_eligible_methods: vec!["GET IT".to_string()],
            ..ProxyConfig::default()
        };
        assert!(matches!(
            bad_method.validated(),
            Err(ConfigError::InvalidMethod(_))
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_proxy_config(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(cfg, ProxyConfig::default());
    }
}
