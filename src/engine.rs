//! The inference execution engine.
//!
//! `HybridRouter` owns the outbound client, the provider registry and the
//! tracing collaborator. `run_inference` is the synchronous-style entry
//! point: select a provider, execute against it, feed the outcome back into
//! the provider's moving averages. Nothing on this path returns an error;
//! every failure becomes a structured `FailureRecord` inside the response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::HttpClient;
use crate::models::{
    FailureRecord, FailureStage, InferenceRequest, InferenceResponse, codes,
};
use crate::registry::{Provider, Registry};
use crate::selector::select_provider;
use crate::trace::{NoopTracer, Tracer};

/// Transport-level retry budget: network errors, timeouts and stopped-app
/// 404s all share it.
const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct HybridRouter<T: HttpClient> {
    pub(crate) client: T,
    pub registry: Registry,
    tracer: Arc<dyn Tracer>,
}

impl<T: HttpClient + Send + Sync> HybridRouter<T> {
    pub fn new(client: T, registry: Registry) -> Self {
        Self {
            client,
            registry,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Attach a real tracing collaborator. The router behaves identically
    /// without one.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Pick a provider for this request from the current registry snapshot.
    pub fn select(&self, request: &InferenceRequest) -> Option<Provider> {
        select_provider(&self.registry.snapshot(), request)
    }

    /// Route a request end to end: select, execute, record metrics.
    pub async fn run_inference(&self, request: &InferenceRequest) -> InferenceResponse {
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span_id = self
            .tracer
            .start_span(
                &trace_id,
                None,
                "hybrid-router",
                "run_inference",
                json!({"model": request.model, "region_preference": request.region_preference}),
            )
            .await;

        let Some(provider) = self.select(request) else {
            let mut failure = FailureRecord::new(
                codes::PROVIDER_UNAVAILABLE,
                FailureStage::ProviderSelection,
                "No healthy providers available for request",
                true,
            );
            failure.model = Some(request.model.clone());
            failure.region = request.region_preference.map(|r| r.to_string());
            warn!(model = %request.model, "no provider available");
            self.tracer
                .complete_span(&span_id, "error", Some(&failure.message), Some(&failure.code))
                .await;
            return InferenceResponse::from_failure(failure, 0.0);
        };

        info!(provider = %provider.name, model = %request.model, "routing inference");
        let response = self.execute(&provider, request).await;

        let status = if response.success { "completed" } else { "error" };
        self.tracer
            .complete_span(
                &span_id,
                status,
                response.error.as_deref(),
                response.error_code.as_deref(),
            )
            .await;
        response
    }

    /// Execute a request against a specific provider. Never fails: all
    /// non-success paths return a response carrying a `FailureRecord`.
    pub async fn execute(&self, provider: &Provider, request: &InferenceRequest) -> InferenceResponse {
        let started = Instant::now();
        let outcome = self.call_provider(provider, request).await;
        let elapsed = started.elapsed().as_secs_f64();

        // Feed the outcome back into the selector's ranking signals.
        self.registry
            .record_execution(&provider.name, elapsed, outcome.is_ok());

        match outcome {
            Ok((text, receipt)) => {
                let mut metadata = serde_json::Map::new();
                metadata.insert("provider_type".into(), Value::String(provider.family.to_string()));
                metadata.insert("region".into(), Value::String(provider.region.to_string()));
                metadata.insert("model".into(), Value::String(request.model.clone()));
                if let Some(receipt) = receipt {
                    metadata.insert("receipt".into(), receipt);
                }
                InferenceResponse {
                    success: true,
                    response: Some(text),
                    error: None,
                    error_code: None,
                    failure: None,
                    provider_used: provider.name.clone(),
                    inference_time: elapsed,
                    cost_estimate: elapsed * provider.cost_per_second,
                    metadata,
                }
            }
            Err(failure) => {
                error!(
                    provider = %provider.name,
                    code = %failure.code,
                    "inference failed: {}",
                    failure.message
                );
                InferenceResponse::from_failure(failure, elapsed)
            }
        }
    }

    /// The raw provider call with transport retries and response
    /// normalization. Returns the generated text and optional receipt.
    async fn call_provider(
        &self,
        provider: &Provider,
        request: &InferenceRequest,
    ) -> Result<(String, Option<Value>), FailureRecord> {
        let family = provider.family;
        let url = family.inference_url(&provider.endpoint);
        let mut last_transport_error = String::new();

        for attempt in 1..=MAX_TRANSPORT_ATTEMPTS {
            let outbound = family
                .build_request(&provider.endpoint, provider.region, request)
                .map_err(|e| {
                    FailureRecord::new(
                        codes::ROUTER_INTERNAL_ERROR,
                        FailureStage::RouterInternal,
                        format!("failed to build provider request: {e}"),
                        false,
                    )
                    .with_context(provider, &request.model)
                    .with_url(&url)
                })?;

            let response = match timeout(family.read_timeout(), self.client.request(outbound)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    last_transport_error = e.to_string();
                    if self
                        .transport_backoff(provider, attempt, &last_transport_error)
                        .await
                    {
                        continue;
                    }
                    break;
                }
                Err(_) => {
                    last_transport_error = format!(
                        "request timed out after {}s",
                        family.read_timeout().as_secs()
                    );
                    if self
                        .transport_backoff(provider, attempt, &last_transport_error)
                        .await
                    {
                        continue;
                    }
                    break;
                }
            };

            let status = response.status().as_u16();
            let body = match axum::body::to_bytes(response.into_body(), usize::MAX).await {
                Ok(body) => body,
                Err(e) => {
                    last_transport_error = format!("failed to read response body: {e}");
                    if self
                        .transport_backoff(provider, attempt, &last_transport_error)
                        .await
                    {
                        continue;
                    }
                    break;
                }
            };

            // A 303 is how Modal signals container death. The client never
            // follows it: the redirect target doubles as a cancellation
            // signal that would tear down the container being diagnosed,
            // and the original response body is what carries the evidence.
            if status == 303 {
                return Err(FailureRecord::new(
                    codes::MODAL_CONTAINER_FAILED,
                    FailureStage::ProviderExecution,
                    "provider signalled container failure via 303 redirect",
                    false,
                )
                .with_context(provider, &request.model)
                .with_http_status(status)
                .with_url(&url));
            }

            // Cold container: the app restarts on demand, so back off and
            // retry the same endpoint.
            if family.is_stopped_app(status, &body) {
                last_transport_error = "serving app is stopped (cold container)".into();
                if self
                    .transport_backoff(provider, attempt, &last_transport_error)
                    .await
                {
                    continue;
                }
                break;
            }

            if !(200..300).contains(&status) {
                let snippet = String::from_utf8_lossy(&body);
                return Err(FailureRecord::new(
                    format!("PROVIDER_HTTP_{status}"),
                    FailureStage::ProviderExecution,
                    format!("HTTP {status}: {}", snippet.chars().take(200).collect::<String>()),
                    status >= 500,
                )
                .with_context(provider, &request.model)
                .with_http_status(status)
                .with_url(&url));
            }

            let normalized = match family.parse_response(&body) {
                Ok(normalized) => normalized,
                Err(e) => {
                    // Malformed success body is a contract bug, not worth
                    // retrying.
                    return Err(FailureRecord::new(
                        codes::MODAL_RESPONSE_PARSE_ERROR,
                        FailureStage::ResponseParsing,
                        format!("unparseable provider response: {e}"),
                        false,
                    )
                    .with_context(provider, &request.model)
                    .with_http_status(status)
                    .with_url(&url));
                }
            };

            if !normalized.success {
                let message = normalized
                    .error
                    .unwrap_or_else(|| "provider reported execution failure".into());
                return Err(FailureRecord::new(
                    codes::PROVIDER_EXECUTION_FAILED,
                    FailureStage::ProviderExecution,
                    message,
                    true,
                )
                .with_context(provider, &request.model)
                .with_http_status(status)
                .with_url(&url));
            }

            return match normalized.text.filter(|text| !text.is_empty()) {
                Some(text) => Ok((text, normalized.receipt)),
                // A legitimate but unhelpful generation; retrying elsewhere
                // may produce content.
                None => Err(FailureRecord::new(
                    codes::EMPTY_MODEL_RESPONSE,
                    FailureStage::ResponseParsing,
                    "provider returned a success response with no content",
                    true,
                )
                .with_context(provider, &request.model)
                .with_http_status(status)
                .with_url(&url)),
            };
        }

        Err(FailureRecord::new(
            codes::MODAL_REQUEST_FAILED,
            FailureStage::ProviderExecution,
            format!(
                "request failed after {MAX_TRANSPORT_ATTEMPTS} attempts: {last_transport_error}"
            ),
            true,
        )
        .with_context(provider, &request.model)
        .with_url(&url))
    }

    /// Sleep before the next transport attempt. Returns false when the
    /// retry budget is exhausted.
    async fn transport_backoff(&self, provider: &Provider, attempt: u32, reason: &str) -> bool {
        if attempt >= MAX_TRANSPORT_ATTEMPTS {
            return false;
        }
        warn!(
            provider = %provider.name,
            attempt,
            "transport attempt failed ({reason}), retrying"
        );
        sleep(Duration::from_secs(u64::from(2 * attempt))).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ProviderFamily;
    use crate::registry::Region;
    use crate::test_utils::MockHttpClient;
    use axum::http::StatusCode;

    fn provider(name: &str, family: ProviderFamily, region: Region) -> Provider {
        Provider::builder()
            .name(name.to_string())
            .family(family)
            .endpoint("https://gpu.example.com".parse().unwrap())
            .region(region)
            .cost_per_second(0.0001)
            .max_concurrent(5)
            .build()
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "llama-3".into(),
            prompt: "hello".into(),
            temperature: 0.1,
            max_tokens: 64,
            region_preference: None,
            cost_priority: true,
            trace_id: None,
        }
    }

    fn router_with(
        client: MockHttpClient,
        providers: Vec<Provider>,
    ) -> HybridRouter<MockHttpClient> {
        HybridRouter::new(client, Registry::new(providers))
    }

    #[tokio::test]
    async fn golem_success_round_trip() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"success": true, "response": "hi"}"#);
        let provider = provider("golem-1", ProviderFamily::Golem, Region::UsEast);
        let router = router_with(client.clone(), vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        assert!(response.success);
        assert_eq!(response.response.as_deref(), Some("hi"));
        assert_eq!(response.provider_used, "golem-1");
        assert_eq!(response.metadata["region"], "us-east");
        assert_eq!(response.metadata["provider_type"], "golem");
        assert!(response.error.is_none());

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "https://gpu.example.com/inference");
        assert_eq!(requests[0].method, "POST");
    }

    #[tokio::test]
    async fn redirect_303_is_terminal_and_never_followed() {
        let client = MockHttpClient::new(StatusCode::SEE_OTHER, "");
        let provider = provider("modal-us", ProviderFamily::Modal, Region::UsEast);
        let router = router_with(client.clone(), vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        assert!(!response.success);
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, codes::MODAL_CONTAINER_FAILED);
        assert!(!failure.transient);
        assert_eq!(failure.http_status, Some(303));
        // Exactly one request: no retry, no redirect following.
        assert_eq!(client.get_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_app_404_retries_then_exhausts() {
        let client = MockHttpClient::new(
            StatusCode::NOT_FOUND,
            "app for invoked web endpoint is stopped",
        );
        let provider = provider("modal-us", ProviderFamily::Modal, Region::UsEast);
        let router = router_with(client.clone(), vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        assert!(!response.success);
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, codes::MODAL_REQUEST_FAILED);
        assert!(failure.transient);
        assert_eq!(client.get_requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_app_404_recovers_mid_retry() {
        let client = MockHttpClient::with_sequence(
            vec![
                (
                    StatusCode::NOT_FOUND,
                    "app for invoked web endpoint is stopped".into(),
                ),
                (
                    StatusCode::OK,
                    r#"{"status": "success", "response": "warm now"}"#.into(),
                ),
            ],
            (StatusCode::INTERNAL_SERVER_ERROR, "unused".into()),
        );
        let provider = provider("modal-us", ProviderFamily::Modal, Region::UsEast);
        let router = router_with(client.clone(), vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        assert!(response.success);
        assert_eq!(response.response.as_deref(), Some("warm now"));
        assert_eq!(client.get_requests().len(), 2);
    }

    #[tokio::test]
    async fn malformed_success_body_is_parse_error() {
        let client = MockHttpClient::new(StatusCode::OK, "<html>cloudflare</html>");
        let provider = provider("modal-us", ProviderFamily::Modal, Region::UsEast);
        let router = router_with(client.clone(), vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, codes::MODAL_RESPONSE_PARSE_ERROR);
        assert!(!failure.transient);
        assert_eq!(client.get_requests().len(), 1);
    }

    #[tokio::test]
    async fn empty_generation_is_transient_failure() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"status": "success", "response": ""}"#);
        let provider = provider("modal-us", ProviderFamily::Modal, Region::UsEast);
        let router = router_with(client, vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, codes::EMPTY_MODEL_RESPONSE);
        assert!(failure.transient);
    }

    #[tokio::test]
    async fn upstream_reported_error_is_execution_failure() {
        let client =
            MockHttpClient::new(StatusCode::OK, r#"{"status": "error", "error": "CUDA OOM"}"#);
        let provider = provider("modal-us", ProviderFamily::Modal, Region::UsEast);
        let router = router_with(client, vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, codes::PROVIDER_EXECUTION_FAILED);
        assert_eq!(response.error.as_deref(), Some("CUDA OOM"));
    }

    #[tokio::test]
    async fn http_status_maps_to_taxonomy_code() {
        let client = MockHttpClient::new(StatusCode::BAD_GATEWAY, "upstream down");
        let provider = provider("golem-1", ProviderFamily::Golem, Region::UsEast);
        let router = router_with(client, vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, "PROVIDER_HTTP_502");
        assert!(failure.transient);

        let client = MockHttpClient::new(StatusCode::UNPROCESSABLE_ENTITY, "bad payload");
        let provider = self::provider("golem-2", ProviderFamily::Golem, Region::UsEast);
        let router = router_with(client, vec![provider.clone()]);
        let response = router.execute(&provider, &request()).await;
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, "PROVIDER_HTTP_422");
        assert!(!failure.transient);
    }

    #[tokio::test]
    async fn run_inference_without_providers_is_unavailable() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let router = router_with(client.clone(), vec![]);

        let response = router.run_inference(&request()).await;
        assert!(!response.success);
        let failure = response.failure.unwrap();
        assert_eq!(failure.code, codes::PROVIDER_UNAVAILABLE);
        assert_eq!(failure.stage, FailureStage::ProviderSelection);
        assert_eq!(response.provider_used, "none");
        // The selector fails before any provider is contacted.
        assert!(client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn execution_outcome_feeds_success_rate() {
        let client = MockHttpClient::new(StatusCode::BAD_GATEWAY, "down");
        let provider = provider("golem-1", ProviderFamily::Golem, Region::UsEast);
        let router = router_with(client, vec![provider.clone()]);

        router.execute(&provider, &request()).await;
        let updated = router.registry.get("golem-1").unwrap();
        assert!(updated.success_rate < 1.0);
        // Execution failures alone never flip the health flag.
        assert!(updated.healthy);
    }

    #[tokio::test]
    async fn modal_receipt_lands_in_metadata() {
        let client = MockHttpClient::new(
            StatusCode::OK,
            r#"{"status": "success", "response": "done", "receipt": {"attestation": "0xabc"}}"#,
        );
        let provider = provider("modal-eu", ProviderFamily::Modal, Region::EuWest);
        let router = router_with(client, vec![provider.clone()]);

        let response = router.execute(&provider, &request()).await;
        assert!(response.success);
        assert_eq!(response.metadata["receipt"]["attestation"], "0xabc");
    }
}
