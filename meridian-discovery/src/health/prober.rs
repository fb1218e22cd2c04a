//! Reachability probes
//!
//! A prober gets an endpoint and a time budget and answers pass or fail.
//! It never errors: transport problems are a failed check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::HealthConfig;

use crate::discovery::ServiceStatus;
use crate::error::{Error, Result};

/// Outcome of a single probe invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthResult {
    /// `Up` for a pass, `Down` for a fail
    pub status: ServiceStatus,
    pub error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl HealthResult {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            status: ServiceStatus::Up,
            error: None,
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn fail(reason: impl fmt::Display) -> Self {
        Self {
            status: ServiceStatus::Down,
            error: Some(reason.to_string()),
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.status == ServiceStatus::Up
    }
}

/// Pluggable health check strategy
#[async_trait]
pub trait Prober: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check `endpoint`, finishing within `budget`
    async fn probe(&self, endpoint: &str, budget: Duration) -> HealthResult;
}

/// GET `endpoint + path`; any 2xx is a pass
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
}

impl HttpProber {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            path: path.into(),
        })
    }

    fn url_for(&self, endpoint: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{endpoint}{}", self.path)
        } else {
            format!("http://{endpoint}{}", self.path)
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn probe(&self, endpoint: &str, budget: Duration) -> HealthResult {
        let url = self.url_for(endpoint);

        match self.client.get(&url).timeout(budget).send().await {
            Ok(response) if response.status().is_success() => HealthResult::pass(),
            Ok(response) => HealthResult::fail(format!("unhealthy status code: {}", response.status().as_u16())),
            Err(e) => HealthResult::fail(e),
        }
    }
}

/// TCP connect within the budget.
/// Accepts "host:port", "[::1]:port" and URL-style endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

impl TcpProber {
    fn socket_address(endpoint: &str) -> Option<String> {
        let without_scheme = endpoint
            .split_once("://")
            .map_or(endpoint, |(_, rest)| rest);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);

        if authority.parse::<std::net::SocketAddr>().is_ok() {
            return Some(authority.to_string());
        }
        let (host, port) = authority.rsplit_once(':')?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(format!("{host}:{port}"))
    }
}

#[async_trait]
impl Prober for TcpProber {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn probe(&self, endpoint: &str, budget: Duration) -> HealthResult {
        let Some(addr) = Self::socket_address(endpoint) else {
            return HealthResult::fail(format!("endpoint {endpoint} has no host:port"));
        };

        match tokio::time::timeout(budget, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => HealthResult::pass(),
            Ok(Err(e)) => HealthResult::fail(e),
            Err(_) => HealthResult::fail(format!("connect to {addr} timed out")),
        }
    }
}

/// Always passes; liveness then rests on heartbeats alone
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProber;

#[async_trait]
impl Prober for NoopProber {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn probe(&self, _endpoint: &str, _budget: Duration) -> HealthResult {
        HealthResult::pass()
    }
}

/// Build the prober named in configuration
pub fn build_prober(config: &HealthConfig) -> Result<Arc<dyn Prober>> {
    match config.probe.as_str() {
        "http" => Ok(Arc::new(HttpProber::new(config.http_path.clone())?)),
        "tcp" => Ok(Arc::new(TcpProber)),
        "none" => Ok(Arc::new(NoopProber)),
        other => Err(Error::Configuration(format!("Unknown probe kind: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_prober_2xx_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let prober = HttpProber::new("/health").unwrap();
        let result = prober.probe(&server.uri(), Duration::from_secs(2)).await;
        assert!(result.is_pass(), "{result:?}");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_http_prober_5xx_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let prober = HttpProber::new("/health").unwrap();
        let result = prober.probe(&server.uri(), Duration::from_secs(2)).await;
        assert_eq!(result.status, ServiceStatus::Down);
        assert!(result.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_http_prober_slow_response_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let prober = HttpProber::new("/health").unwrap();
        let result = prober.probe(&server.uri(), Duration::from_millis(50)).await;
        assert!(!result.is_pass());
    }

    #[test]
    fn test_http_url_for() {
        let prober = HttpProber::new("/healthz").unwrap();
        assert_eq!(prober.url_for("http://10.0.0.1:80/"), "http://10.0.0.1:80/healthz");
        assert_eq!(prober.url_for("10.0.0.1:80"), "http://10.0.0.1:80/healthz");
    }

    #[test]
    fn test_tcp_socket_address() {
        assert_eq!(TcpProber::socket_address("10.0.0.1:80").as_deref(), Some("10.0.0.1:80"));
        assert_eq!(TcpProber::socket_address("[::1]:50051").as_deref(), Some("[::1]:50051"));
        assert_eq!(
            TcpProber::socket_address("http://svc.local:8080/api").as_deref(),
            Some("svc.local:8080")
        );
        assert!(TcpProber::socket_address("svc.local").is_none());
        assert!(TcpProber::socket_address("svc.local:http").is_none());
    }

    #[tokio::test]
    async fn test_tcp_prober_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let result = TcpProber.probe(&addr, Duration::from_secs(1)).await;
        assert!(result.is_pass());

        drop(listener);
        let result = TcpProber.probe(&addr, Duration::from_secs(1)).await;
        assert!(!result.is_pass());
    }

    #[test]
    fn test_build_prober() {
        let mut config = HealthConfig::default();
        assert_eq!(build_prober(&config).unwrap().name(), "http");
        config.probe = "none".to_string();
        assert_eq!(build_prober(&config).unwrap().name(), "none");
        config.probe = "icmp".to_string();
        assert!(matches!(build_prober(&config), Err(Error::Configuration(_))));
    }
}
