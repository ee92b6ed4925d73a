/// Request, response and failure types for the inference path.
///
/// An `InferenceRequest` comes in from a caller, gets routed to a provider,
/// and comes back as an `InferenceResponse`. Failures are never surfaced as
/// errors: they are carried inside the response as a structured
/// `FailureRecord` so callers always get the same envelope.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::{Provider, Region};

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    512
}

fn default_cost_priority() -> bool {
    true
}

/// A caller's inference request. Immutable once received.
///
/// `region_preference` is strict: when set, no cross-region fallback is
/// performed. `cost_priority` switches the provider ranking between
/// cheapest-first and fastest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub region_preference: Option<Region>,
    #[serde(default = "default_cost_priority")]
    pub cost_priority: bool,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// The routed result handed back to the caller.
///
/// On success `response` is always populated. On failure `error`,
/// `error_code` and `failure` are always populated together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    pub provider_used: String,
    pub inference_time: f64,
    pub cost_estimate: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InferenceResponse {
    /// Build a failure response around a `FailureRecord`. The error message
    /// and code are duplicated at the top level for callers that don't dig
    /// into the structured record.
    pub fn from_failure(failure: FailureRecord, inference_time: f64) -> Self {
        let provider_used = failure.provider.clone().unwrap_or_else(|| "none".into());
        InferenceResponse {
            success: false,
            response: None,
            error: Some(failure.message.clone()),
            error_code: Some(failure.code.clone()),
            provider_used,
            inference_time,
            cost_estimate: 0.0,
            metadata: failure.metadata(),
            failure: Some(failure),
        }
    }
}

/// The stage of the routing pipeline a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    ProviderSelection,
    ProviderExecution,
    ResponseParsing,
    RouterInternal,
}

/// Structured failure taxonomy unit. Built by the execution engine (or the
/// selector for `PROVIDER_UNAVAILABLE`) and never mutated afterwards.
/// Empty fields are omitted from the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub code: String,
    pub stage: FailureStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Whether a retry elsewhere may plausibly succeed. Operator guidance
    /// only: the queue retries regardless.
    pub transient: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: f64,
}

impl FailureRecord {
    pub fn new(
        code: impl Into<String>,
        stage: FailureStage,
        message: impl Into<String>,
        transient: bool,
    ) -> Self {
        FailureRecord {
            code: code.into(),
            stage,
            message: message.into(),
            provider: None,
            provider_type: None,
            region: None,
            model: None,
            transient,
            http_status: None,
            url: None,
            timestamp: crate::unix_now(),
        }
    }

    /// Attach the provider and request context a failure occurred under.
    pub fn with_context(mut self, provider: &Provider, model: &str) -> Self {
        self.provider = Some(provider.name.clone());
        self.provider_type = Some(provider.family.to_string());
        self.region = Some(provider.region.to_string());
        self.model = Some(model.to_string());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Provider/region/model metadata for the response envelope.
    fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        if let Some(provider_type) = &self.provider_type {
            metadata.insert("provider_type".into(), Value::String(provider_type.clone()));
        }
        if let Some(region) = &self.region {
            metadata.insert("region".into(), Value::String(region.clone()));
        }
        if let Some(model) = &self.model {
            metadata.insert("model".into(), Value::String(model.clone()));
        }
        metadata
    }
}

/// Failure codes emitted by the router. `PROVIDER_HTTP_<nnn>` is generated
/// from the upstream status and is not listed here.
pub mod codes {
    pub const PROVIDER_UNAVAILABLE: &str = "PROVIDER_UNAVAILABLE";
    pub const MODAL_REQUEST_FAILED: &str = "MODAL_REQUEST_FAILED";
    pub const MODAL_RESPONSE_PARSE_ERROR: &str = "MODAL_RESPONSE_PARSE_ERROR";
    pub const MODAL_CONTAINER_FAILED: &str = "MODAL_CONTAINER_FAILED";
    pub const EMPTY_MODEL_RESPONSE: &str = "EMPTY_MODEL_RESPONSE";
    pub const PROVIDER_EXECUTION_FAILED: &str = "PROVIDER_EXECUTION_FAILED";
    pub const ROUTER_INTERNAL_ERROR: &str = "ROUTER_INTERNAL_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_applied() {
        let request: InferenceRequest =
            serde_json::from_str(r#"{"model": "llama-3", "prompt": "hi"}"#).unwrap();
        assert_eq!(request.temperature, 0.1);
        assert_eq!(request.max_tokens, 512);
        assert!(request.cost_priority);
        assert!(request.region_preference.is_none());
    }

    #[test]
    fn failure_record_omits_empty_fields() {
        let failure = FailureRecord::new(
            codes::PROVIDER_UNAVAILABLE,
            FailureStage::ProviderSelection,
            "no healthy providers",
            false,
        );
        let serialized = serde_json::to_value(&failure).unwrap();
        let object = serialized.as_object().unwrap();
        assert!(!object.contains_key("provider"));
        assert!(!object.contains_key("http_status"));
        assert!(!object.contains_key("url"));
        assert_eq!(object["code"], "PROVIDER_UNAVAILABLE");
        assert_eq!(object["stage"], "provider_selection");
    }

    #[test]
    fn failure_response_populates_error_fields_together() {
        let failure = FailureRecord::new(
            codes::ROUTER_INTERNAL_ERROR,
            FailureStage::RouterInternal,
            "boom",
            false,
        );
        let response = InferenceResponse::from_failure(failure, 0.5);
        assert!(!response.success);
        assert!(response.error.is_some());
        assert!(response.error_code.is_some());
        assert!(response.failure.is_some());
        assert_eq!(response.cost_estimate, 0.0);
        assert_eq!(response.inference_time, 0.5);
    }
}
