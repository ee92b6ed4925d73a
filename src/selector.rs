/// Provider selection: filter a registry snapshot by health and region,
/// rank by the request's priority, and pick the first provider with
/// capacity headroom.
///
/// Pure over its inputs; the caller takes a snapshot so selection never
/// races registry writers.
use tracing::debug;

use crate::models::InferenceRequest;
use crate::registry::Provider;

/// Select the best provider for a request, or `None` when nothing healthy
/// matches.
///
/// The region lock is strict by design: when `region_preference` is set and
/// no healthy provider lives there, this returns `None` rather than silently
/// routing cross-region. Callers that want fallback must re-request without
/// the preference.
pub fn select_provider(snapshot: &[Provider], request: &InferenceRequest) -> Option<Provider> {
    let mut candidates: Vec<&Provider> = snapshot.iter().filter(|p| p.healthy).collect();
    if candidates.is_empty() {
        return None;
    }

    if let Some(region) = request.region_preference {
        candidates.retain(|p| p.region == region);
        if candidates.is_empty() {
            debug!(%region, "no healthy provider in requested region");
            return None;
        }
    }

    if request.cost_priority {
        candidates.sort_by(|a, b| {
            (a.cost_per_second, a.avg_latency)
                .partial_cmp(&(b.cost_per_second, b.avg_latency))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    } else {
        candidates.sort_by(|a, b| {
            (a.avg_latency, a.cost_per_second)
                .partial_cmp(&(b.avg_latency, b.cost_per_second))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    // max_concurrent is an admission hint, not a live counter. If no entry
    // has headroom, degrade to the top-ranked candidate rather than reject.
    candidates
        .iter()
        .find(|p| p.max_concurrent > 0)
        .or_else(|| candidates.first())
        .map(|p| (*p).clone())
}
