/// Axum handlers for the router's HTTP surface.
///
/// The inference path always answers 200 with the routed envelope, success
/// or not; HTTP error codes are reserved for problems with the request
/// itself (unknown region, unknown job).
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::AppState;
use crate::client::HttpClient;
use crate::models::{InferenceRequest, InferenceResponse};
use crate::queue::{EnqueueReceipt, JobRecord, QueuedJob, RegionQueueStatus};
use crate::registry::Region;

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    512
}

/// Body of a queue submission. Region is mandatory here: queued work is
/// admitted into a specific region's lane.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub region: Region,
}

#[derive(Debug, Deserialize)]
pub struct ProvidersQuery {
    pub region: Option<String>,
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

/// Synchronous routing: select, execute, answer inline.
#[instrument(skip(state, request), fields(model = %request.model))]
pub async fn run_inference<T: HttpClient + Send + Sync>(
    State(state): State<AppState<T>>,
    Json(request): Json<InferenceRequest>,
) -> Json<InferenceResponse> {
    Json(state.router.run_inference(&request).await)
}

/// Queue submission: hand the job to its region's lane and answer with the
/// admission receipt.
#[instrument(skip(state, request), fields(model = %request.model, region = %request.region))]
pub async fn submit_job<T: HttpClient>(
    State(state): State<AppState<T>>,
    Json(request): Json<SubmitJobRequest>,
) -> Json<EnqueueReceipt> {
    let job = QueuedJob::new(
        request.model,
        request.prompt,
        request.temperature,
        request.max_tokens,
        request.region,
    );
    Json(state.queue.enqueue(job).await)
}

#[instrument(skip(state))]
pub async fn job_status<T: HttpClient>(
    State(state): State<AppState<T>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, StatusCode> {
    state
        .queue
        .job_status(&job_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[instrument(skip(state))]
pub async fn queue_status<T: HttpClient>(
    State(state): State<AppState<T>>,
) -> Json<Vec<RegionQueueStatus>> {
    Json(state.queue.statuses().await)
}

#[instrument(skip(state))]
pub async fn region_queue_status<T: HttpClient>(
    State(state): State<AppState<T>>,
    Path(region): Path<String>,
) -> Result<Json<RegionQueueStatus>, (StatusCode, Json<Value>)> {
    let region =
        Region::parse(&region).ok_or_else(|| bad_request(format!("unknown region: {region}")))?;
    Ok(Json(state.queue.status(region).await))
}

/// List the fleet, optionally narrowed to one region.
#[instrument(skip(state))]
pub async fn list_providers<T: HttpClient>(
    State(state): State<AppState<T>>,
    Query(query): Query<ProvidersQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let region = match &query.region {
        Some(label) => Some(
            Region::parse(label).ok_or_else(|| bad_request(format!("unknown region: {label}")))?,
        ),
        None => None,
    };

    let mut providers = state.router.registry.snapshot();
    if let Some(region) = region {
        providers.retain(|p| p.region == region);
    }
    providers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(json!({
        "count": providers.len(),
        "providers": providers,
    })))
}

/// Liveness plus a fleet summary.
#[instrument(skip(state))]
pub async fn health<T: HttpClient>(State(state): State<AppState<T>>) -> Json<Value> {
    let snapshot = state.router.registry.snapshot();
    let healthy = snapshot.iter().filter(|p| p.healthy).count();
    Json(json!({
        "status": "ok",
        "providers": {"total": snapshot.len(), "healthy": healthy},
    }))
}

/// Force an immediate probe round and report the settled flags.
#[instrument(skip(state))]
pub async fn trigger_health_check<T: HttpClient + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Json<Value> {
    state.router.health_check_all().await;
    let snapshot = state.router.registry.snapshot();
    let healthy = snapshot.iter().filter(|p| p.healthy).count();
    info!("manual health check settled: {healthy}/{} healthy", snapshot.len());
    let providers: Vec<Value> = snapshot
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "region": p.region,
                "healthy": p.healthy,
                "last_health_check": p.last_health_check,
            })
        })
        .collect();
    Json(json!({
        "checked": snapshot.len(),
        "healthy": healthy,
        "providers": providers,
    }))
}
