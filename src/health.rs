//! Provider health checking.
//!
//! `health_check_all` probes every registered provider concurrently and
//! waits for all probes to settle; no probe error can abort the others or
//! reach the caller. Each settled probe writes its provider's `healthy`
//! flag and check timestamp independently. This is the only place health
//! flags are written.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::HttpClient;
use crate::engine::HybridRouter;
use crate::registry::Provider;

impl<T: HttpClient + Send + Sync> HybridRouter<T> {
    /// Probe every provider concurrently (fan-out, await-all).
    pub async fn health_check_all(&self) {
        let snapshot = self.registry.snapshot();
        debug!("health checking {} providers", snapshot.len());
        join_all(snapshot.iter().map(|p| self.check_provider(p))).await;
    }

    async fn check_provider(&self, provider: &Provider) {
        let healthy = match self.probe(provider).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(provider = %provider.name, "health check failed: {e}");
                false
            }
        };
        debug!(provider = %provider.name, healthy, "health probe settled");
        self.registry.set_health(&provider.name, healthy);
    }

    /// One probe round trip. The probe shape and judgement are
    /// family-specific; the Modal probe is a real inference call and so
    /// inherits the cold-start deadline.
    async fn probe(&self, provider: &Provider) -> Result<bool, anyhow::Error> {
        let family = provider.family;
        let request = family.build_health_probe(&provider.endpoint, provider.region)?;

        let response = timeout(family.probe_timeout(), self.client.request(request))
            .await
            .map_err(|_| anyhow!("probe timed out after {}s", family.probe_timeout().as_secs()))?
            .map_err(|e| anyhow!("probe transport error: {e}"))?;

        let status = response.status().as_u16();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| anyhow!("failed to read probe body: {e}"))?;

        Ok(family.evaluate_probe(status, &body))
    }
}

/// Re-probe the fleet forever at a fixed interval. Spawned once at startup;
/// never returns.
pub async fn run_health_loop<T: HttpClient + Send + Sync>(
    router: Arc<HybridRouter<T>>,
    interval: Duration,
) {
    info!("health check loop started, interval {}s", interval.as_secs());
    loop {
        router.health_check_all().await;
        let healthy = router
            .registry
            .snapshot()
            .iter()
            .filter(|p| p.healthy)
            .count();
        debug!("{healthy}/{} providers healthy", router.registry.len());
        tokio::time::sleep(interval).await;
    }
}
