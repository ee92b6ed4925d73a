//! HTTP client abstraction for calling provider endpoints
//!
//! This module provides a unified interface for making HTTP requests, allowing
//! different client implementations (hyper, mock clients for testing, etc.) to
//! be used interchangeably throughout the router.
//!
//! Timeouts are split: connect and pool-acquire deadlines are short and
//! configured here, while the long read deadline (cold starts can run for
//! minutes) is applied per request by the execution engine. The hyper client
//! never follows redirects, which the engine's 303 handling depends on.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

pub type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, axum::body::Body>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn create_hyper_client() -> Result<HyperClient, anyhow::Error> {
    // Connect failures should fail fast; slow generation must not.
    let connect_timeout_secs = env_u64("BEACON_CONNECT_TIMEOUT_SECS", 10);
    let pool_idle_timeout_secs = env_u64("BEACON_POOL_IDLE_TIMEOUT_SECS", 90);
    let pool_max_idle_per_host = std::env::var("BEACON_POOL_MAX_IDLE_PER_HOST")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);

    tracing::debug!(
        "HTTP client config: connect_timeout={}s, pool_idle_timeout={}s, max_idle_per_host={}",
        connect_timeout_secs,
        pool_idle_timeout_secs,
        pool_max_idle_per_host
    );

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(std::time::Duration::from_secs(connect_timeout_secs)));

    let tls = hyper_tls::native_tls::TlsConnector::new()?;
    let https = hyper_tls::HttpsConnector::from((http, tls.into()));

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(std::time::Duration::from_secs(pool_idle_timeout_secs))
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https))
}
