//! Beacon - a hybrid inference router
//!
//! This library routes LLM inference across a heterogeneous fleet of GPU
//! providers spread over fixed geographic regions. It keeps a registry of
//! providers with live health and performance state, picks the best
//! candidate per request, executes with a structured failure taxonomy, and
//! runs per-region admission queues with cross-region retry escalation.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{info, instrument};

pub mod client;
pub mod engine;
pub mod family;
pub mod handlers;
pub mod health;
pub mod models;
pub mod queue;
pub mod registry;
pub mod selector;
pub mod trace;

use client::{HttpClient, HyperClient, create_hyper_client};
use engine::HybridRouter;
use queue::QueueManager;
use registry::Registry;

/// Seconds since the Unix epoch, as used in all recorded timestamps.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The main application state: the execution engine and the queue system.
#[derive(Debug)]
pub struct AppState<T: HttpClient> {
    pub router: Arc<HybridRouter<T>>,
    pub queue: Arc<QueueManager>,
}

impl<T: HttpClient> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(registry: Registry) -> Result<Self, anyhow::Error> {
        let http_client = create_hyper_client()?;
        Ok(Self::with_client(registry, http_client))
    }
}

impl<T: HttpClient + Send + Sync> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(registry: Registry, http_client: T) -> Self {
        Self {
            router: Arc::new(HybridRouter::new(http_client, registry)),
            queue: Arc::new(QueueManager::new()),
        }
    }
}

impl<T: HttpClient + Send + Sync + 'static> AppState<T> {
    /// Spawn the per-region queue workers against this state's engine.
    pub fn start_queue_workers(&self) {
        self.queue.start_workers(Arc::clone(&self.router));
    }
}

/// Build the main router. This creates routes for:
/// - `POST /inference` - Synchronous routing
/// - `POST /queue/submit`, `GET /jobs/{job_id}` - Queued routing
/// - `GET /queue/status[/{region}]` - Queue visibility
/// - `GET /providers` - Fleet visibility
/// - `GET /health`, `POST /health/check` - Liveness and manual probes
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/inference", post(handlers::run_inference))
        .route("/queue/submit", post(handlers::submit_job))
        .route("/jobs/{job_id}", get(handlers::job_status))
        .route("/queue/status", get(handlers::queue_status))
        .route("/queue/status/{region}", get(handlers::region_queue_status))
        .route("/providers", get(handlers::list_providers))
        .route("/health", get(handlers::health))
        .route("/health/check", post(handlers::trigger_health_check))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

pub mod test_utils {
    //! A scriptable `HttpClient` used by unit and integration tests.

    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum MockOutcome {
        Respond(StatusCode, String),
        Fail(String),
    }

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        sequence: Arc<Mutex<VecDeque<(StatusCode, String)>>>,
        fallback: MockOutcome,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        /// Answer every request with the same status and body.
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                sequence: Arc::new(Mutex::new(VecDeque::new())),
                fallback: MockOutcome::Respond(status, body.to_string()),
            }
        }

        /// Answer the first requests from `responses` in order, then fall
        /// back to `fallback` forever.
        pub fn with_sequence(
            responses: Vec<(StatusCode, String)>,
            fallback: (StatusCode, String),
        ) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                sequence: Arc::new(Mutex::new(responses.into())),
                fallback: MockOutcome::Respond(fallback.0, fallback.1),
            }
        }

        /// Fail every request at the transport level with `message`.
        pub fn failing(message: &str) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                sequence: Arc::new(Mutex::new(VecDeque::new())),
                fallback: MockOutcome::Fail(message.to_string()),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                sequence: Arc::clone(&self.sequence),
                fallback: self.fallback.clone(),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            let scripted = self.sequence.lock().unwrap().pop_front();
            let outcome = match scripted {
                Some((status, body)) => MockOutcome::Respond(status, body),
                None => self.fallback.clone(),
            };
            match outcome {
                MockOutcome::Respond(status, body) => Ok(axum::response::Response::builder()
                    .status(status)
                    .body(axum::body::Body::from(body))
                    .unwrap()),
                MockOutcome::Fail(message) => Err(message.into()),
            }
        }
    }
}
