/// The provider registry: the static fleet definition plus its mutable
/// runtime health and performance state.
///
/// Providers are loaded once at startup, either from a JSON config file or
/// from environment variables, and live for the process lifetime. The
/// registry is the single source of truth the selector reads; health fields
/// are written only by the health checker and the EMA metrics only by the
/// execution path, so each record has one writer per field group.
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use bon::Builder;
use dashmap::DashMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};
use url::Url;

use crate::family::ProviderFamily;

/// Weight of the prior in the latency / success-rate moving averages.
const EMA_PRIOR_WEIGHT: f64 = 0.9;

/// One of the fixed geographic deployment zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    UsEast,
    EuWest,
    AsiaPacific,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::UsEast, Region::EuWest, Region::AsiaPacific];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::UsEast => "us-east",
            Region::EuWest => "eu-west",
            Region::AsiaPacific => "asia-pacific",
        }
    }

    /// Parse a region label leniently. Accepts the canonical names, the
    /// short queue labels (US / EU / ASIA) and the airport-style codes that
    /// show up in deployment hostnames.
    pub fn parse(label: &str) -> Option<Region> {
        match label.trim().to_ascii_lowercase().as_str() {
            "us-east" | "us" | "iad" => Some(Region::UsEast),
            "eu-west" | "eu" | "ams" => Some(Region::EuWest),
            "asia-pacific" | "asia" | "apac" | "sin" => Some(Region::AsiaPacific),
            _ => None,
        }
    }

    /// Infer a region from an endpoint URL, as deployment hostnames embed
    /// either the region name or its airport code.
    pub fn from_endpoint(endpoint: &str) -> Option<Region> {
        let endpoint = endpoint.to_ascii_lowercase();
        if endpoint.contains("us-east") || endpoint.contains("iad") {
            Some(Region::UsEast)
        } else if endpoint.contains("eu-west") || endpoint.contains("ams") {
            Some(Region::EuWest)
        } else if endpoint.contains("asia") || endpoint.contains("sin") {
            Some(Region::AsiaPacific)
        } else {
            None
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Region {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Region {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Region::parse(&label).ok_or_else(|| D::Error::custom(format!("unknown region: {label}")))
    }
}

/// One backend instance: identity plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct Provider {
    pub name: String,
    pub family: ProviderFamily,
    pub endpoint: Url,
    pub region: Region,
    pub cost_per_second: f64,
    pub max_concurrent: u32,
    /// Mutated only by the health checker.
    #[serde(default = "default_healthy")]
    #[builder(default = true)]
    pub healthy: bool,
    /// Unix seconds of the last settled probe, 0 before the first one.
    #[serde(default)]
    #[builder(default)]
    pub last_health_check: f64,
    /// EMA over observed inference latencies, seconds.
    #[serde(default)]
    #[builder(default)]
    pub avg_latency: f64,
    /// EMA over execution outcomes, in [0, 1].
    #[serde(default = "default_success_rate")]
    #[builder(default = 1.0)]
    pub success_rate: f64,
}

fn default_healthy() -> bool {
    true
}

fn default_success_rate() -> f64 {
    1.0
}

/// The providers config file: a flat list of fleet entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub providers: Vec<Provider>,
}

/// Process-lifetime collection of providers, keyed by unique name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    providers: Arc<DashMap<String, Provider>>,
}

impl Registry {
    pub fn new(providers: Vec<Provider>) -> Self {
        let map = Arc::new(DashMap::new());
        for provider in providers {
            map.insert(provider.name.clone(), provider);
        }
        Registry { providers: map }
    }

    pub async fn from_config_file(config_path: &PathBuf) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read providers file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let config_file: ConfigFile = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse providers file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let registry = Registry::new(config_file.providers);
        info!(
            "Loaded {} providers from {}",
            registry.len(),
            config_path.display()
        );
        Ok(registry)
    }

    /// Build the fleet from environment variables:
    /// `GOLEM_PROVIDER_ENDPOINTS` (comma separated, region inferred from each
    /// URL), `MODAL_{US,EU,APAC}_INFERENCE_URL` with `MODAL_API_BASE` as the
    /// shared fallback, and `RUNPOD_API_BASE` (one provider per region).
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let mut providers = Vec::new();

        let golem_endpoints = std::env::var("GOLEM_PROVIDER_ENDPOINTS").unwrap_or_default();
        for (i, endpoint) in golem_endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .enumerate()
        {
            let url: Url = endpoint
                .parse()
                .map_err(|e| anyhow!("Invalid golem endpoint {endpoint}: {e}"))?;
            let region = Region::from_endpoint(endpoint).unwrap_or_else(|| {
                warn!(endpoint, "could not infer region from endpoint, assuming us-east");
                Region::UsEast
            });
            providers.push(
                Provider::builder()
                    .name(format!("golem-{}", i + 1))
                    .family(ProviderFamily::Golem)
                    .endpoint(url)
                    .region(region)
                    .cost_per_second(0.0001)
                    .max_concurrent(5)
                    .build(),
            );
        }

        let modal_fallback = std::env::var("MODAL_API_BASE").ok();
        let modal_regional = [
            (Region::UsEast, "MODAL_US_INFERENCE_URL"),
            (Region::EuWest, "MODAL_EU_INFERENCE_URL"),
            (Region::AsiaPacific, "MODAL_APAC_INFERENCE_URL"),
        ];
        for (region, var) in modal_regional {
            let Some(endpoint) = std::env::var(var).ok().or_else(|| modal_fallback.clone())
            else {
                continue;
            };
            let url: Url = endpoint
                .parse()
                .map_err(|e| anyhow!("Invalid modal endpoint {endpoint}: {e}"))?;
            providers.push(
                Provider::builder()
                    .name(format!("modal-{region}"))
                    .family(ProviderFamily::Modal)
                    .endpoint(url)
                    .region(region)
                    .cost_per_second(0.0003)
                    .max_concurrent(10)
                    .build(),
            );
        }

        if let Ok(endpoint) = std::env::var("RUNPOD_API_BASE") {
            let url: Url = endpoint
                .parse()
                .map_err(|e| anyhow!("Invalid runpod endpoint {endpoint}: {e}"))?;
            for region in Region::ALL {
                providers.push(
                    Provider::builder()
                        .name(format!("runpod-{region}"))
                        .family(ProviderFamily::Runpod)
                        .endpoint(url.clone())
                        .region(region)
                        .cost_per_second(0.00025)
                        .max_concurrent(8)
                        .build(),
                );
            }
        }

        info!("Built registry with {} providers from environment", providers.len());
        Ok(Registry::new(providers))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Provider> {
        self.providers.get(name).map(|entry| entry.value().clone())
    }

    /// A point-in-time copy of every provider record. The selector works on
    /// snapshots so ranking never holds map locks.
    pub fn snapshot(&self) -> Vec<Provider> {
        self.providers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Record a settled health probe. Health checker only.
    pub fn set_health(&self, name: &str, healthy: bool) {
        if let Some(mut entry) = self.providers.get_mut(name) {
            entry.healthy = healthy;
            entry.last_health_check = crate::unix_now();
        }
    }

    /// Fold an execution outcome into the provider's moving averages.
    /// Called by the execution path after every attempt settles; execution
    /// failures alone never flip the health flag.
    pub fn record_execution(&self, name: &str, elapsed: f64, success: bool) {
        if let Some(mut entry) = self.providers.get_mut(name) {
            entry.avg_latency =
                entry.avg_latency * EMA_PRIOR_WEIGHT + elapsed * (1.0 - EMA_PRIOR_WEIGHT);
            let sample = if success { 1.0 - EMA_PRIOR_WEIGHT } else { 0.0 };
            entry.success_rate = entry.success_rate * EMA_PRIOR_WEIGHT + sample;
        }
    }
}
