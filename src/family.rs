//! Provider families and their wire formats.
//!
//! Each family exposes the same contract: shape an outbound request, then
//! normalize whatever came back into a `NormalizedResponse`. Adding a family
//! means adding one variant and filling in these methods, not editing branch
//! chains elsewhere in the router.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::models::InferenceRequest;
use crate::registry::Region;

/// Read deadline for the serverless family. Cold containers can take minutes
/// to start serving, so aborting early would kill legitimate generations.
const COLD_START_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Read deadline for warm families.
const WARM_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Body marker Modal returns on a 404 while the serving app is scaled to
/// zero. Retryable: the container restarts on demand.
const STOPPED_APP_MARKER: &str = "app for invoked web endpoint is stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    /// Self-hosted baseline capacity. Plain `/inference` endpoint with a
    /// `{success, response}` body and a cheap `/health` probe.
    Golem,
    /// Serverless burst capacity. Single unified endpoint that routes on a
    /// `region` field; cold-start prone, signals container death via 303.
    Modal,
    /// Serverless with a `/run` wrapper shape (`{input: {...}}` in,
    /// `{output: {...}}` out).
    Runpod,
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderFamily::Golem => "golem",
            ProviderFamily::Modal => "modal",
            ProviderFamily::Runpod => "runpod",
        };
        f.write_str(name)
    }
}

/// A provider response reduced to the router's common schema.
#[derive(Debug, Clone, Default)]
pub struct NormalizedResponse {
    pub success: bool,
    pub text: Option<String>,
    pub error: Option<String>,
    pub receipt: Option<Value>,
}

impl ProviderFamily {
    /// The URL inference requests are posted to.
    pub fn inference_url(&self, endpoint: &Url) -> String {
        let base = endpoint.as_str().trim_end_matches('/');
        match self {
            ProviderFamily::Golem => format!("{base}/inference"),
            ProviderFamily::Modal => base.to_string(),
            ProviderFamily::Runpod => format!("{base}/run"),
        }
    }

    /// Per-request read deadline. Connect/pool timeouts are short and live on
    /// the client; this is the long half of the split.
    pub fn read_timeout(&self) -> Duration {
        match self {
            ProviderFamily::Modal => COLD_START_READ_TIMEOUT,
            _ => WARM_READ_TIMEOUT,
        }
    }

    /// Bearer token for the family, when its platform requires one.
    pub fn bearer_token(&self) -> Option<String> {
        let var = match self {
            ProviderFamily::Golem => return None,
            ProviderFamily::Modal => "MODAL_API_TOKEN",
            ProviderFamily::Runpod => "RUNPOD_API_KEY",
        };
        std::env::var(var).ok().filter(|token| !token.is_empty())
    }

    /// The family-specific JSON payload for an inference call.
    ///
    /// Modal additionally carries the selected provider's region so its
    /// unified endpoint dispatches to the matching regional function.
    pub fn build_payload(&self, region: Region, request: &InferenceRequest) -> Value {
        match self {
            ProviderFamily::Golem => json!({
                "model": request.model,
                "prompt": request.prompt,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }),
            ProviderFamily::Modal => json!({
                "model": request.model,
                "prompt": request.prompt,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "region": region,
            }),
            ProviderFamily::Runpod => json!({
                "input": {
                    "model": request.model,
                    "prompt": request.prompt,
                    "temperature": request.temperature,
                    "max_tokens": request.max_tokens,
                }
            }),
        }
    }

    /// Build the outbound HTTP request for an inference call.
    pub fn build_request(
        &self,
        endpoint: &Url,
        region: Region,
        request: &InferenceRequest,
    ) -> Result<axum::extract::Request, anyhow::Error> {
        let payload = self.build_payload(region, request);
        post_json(&self.inference_url(endpoint), endpoint, self.bearer_token(), &payload)
    }

    /// Build the health probe for this family.
    ///
    /// Golem and Runpod get a lightweight `GET /health`. Modal gets a minimal
    /// real inference call: its web endpoints answer 200 while the model
    /// container behind them is dead, so only a success-shaped inference
    /// response counts as healthy.
    pub fn build_health_probe(
        &self,
        endpoint: &Url,
        region: Region,
    ) -> Result<axum::extract::Request, anyhow::Error> {
        match self {
            ProviderFamily::Golem | ProviderFamily::Runpod => {
                let base = endpoint.as_str().trim_end_matches('/');
                get(&format!("{base}/health"), endpoint, self.bearer_token())
            }
            ProviderFamily::Modal => {
                let probe = InferenceRequest {
                    model: "default".into(),
                    prompt: "ping".into(),
                    temperature: 0.0,
                    max_tokens: 1,
                    region_preference: None,
                    cost_priority: true,
                    trace_id: None,
                };
                self.build_request(endpoint, region, &probe)
            }
        }
    }

    /// Timeout for the health probe. The Modal probe runs a real inference,
    /// so it inherits the cold-start read deadline.
    pub fn probe_timeout(&self) -> Duration {
        match self {
            ProviderFamily::Modal => COLD_START_READ_TIMEOUT,
            _ => Duration::from_secs(5),
        }
    }

    /// Judge a settled probe response.
    pub fn evaluate_probe(&self, status: u16, body: &[u8]) -> bool {
        match self {
            ProviderFamily::Golem | ProviderFamily::Runpod => status == 200,
            ProviderFamily::Modal => {
                status == 200
                    && self
                        .parse_response(body)
                        .map(|normalized| normalized.success)
                        .unwrap_or(false)
            }
        }
    }

    /// Whether a response body is the Modal stopped-app marker. Other
    /// families never report it.
    pub fn is_stopped_app(&self, status: u16, body: &[u8]) -> bool {
        *self == ProviderFamily::Modal
            && status == 404
            && String::from_utf8_lossy(body).contains(STOPPED_APP_MARKER)
    }

    /// Normalize a 200 response body into the router's common schema.
    pub fn parse_response(&self, body: &[u8]) -> Result<NormalizedResponse, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        Ok(match self {
            ProviderFamily::Golem => NormalizedResponse {
                success: value["success"].as_bool().unwrap_or(false),
                text: value["response"].as_str().map(str::to_string),
                error: value["error"].as_str().map(str::to_string),
                receipt: None,
            },
            ProviderFamily::Modal => {
                // Modal returns {status: "success" | "error", ...}; older
                // deployments use a boolean "success" field instead.
                let success = value["success"].as_bool().unwrap_or_else(|| {
                    value["status"]
                        .as_str()
                        .map(|status| status.eq_ignore_ascii_case("success"))
                        .unwrap_or(false)
                });
                let text = ["response", "output", "text"]
                    .iter()
                    .find_map(|key| value[*key].as_str())
                    .map(str::to_string);
                NormalizedResponse {
                    success,
                    text,
                    error: value["error"].as_str().map(str::to_string),
                    receipt: value.get("receipt").filter(|r| !r.is_null()).cloned(),
                }
            }
            ProviderFamily::Runpod => {
                let output = &value["output"];
                NormalizedResponse {
                    success: output.is_object(),
                    text: output["response"].as_str().map(str::to_string),
                    error: value["error"].as_str().map(str::to_string),
                    receipt: None,
                }
            }
        })
    }
}

fn host_value(endpoint: &Url) -> Option<String> {
    endpoint.host_str().map(|host| match endpoint.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn post_json(
    url: &str,
    endpoint: &Url,
    bearer: Option<String>,
    payload: &Value,
) -> Result<axum::extract::Request, anyhow::Error> {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri(url)
        .header("content-type", "application/json");
    if let Some(host) = host_value(endpoint) {
        builder = builder.header("host", host);
    }
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(axum::body::Body::from(serde_json::to_vec(payload)?))
        .context("failed to build outbound request")
}

fn get(
    url: &str,
    endpoint: &Url,
    bearer: Option<String>,
) -> Result<axum::extract::Request, anyhow::Error> {
    let mut builder = axum::http::Request::builder().method("GET").uri(url);
    if let Some(host) = host_value(endpoint) {
        builder = builder.header("host", host);
    }
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(axum::body::Body::empty())
        .context("failed to build probe request")
}
