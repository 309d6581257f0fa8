use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::sink::http::HttpSinkConfig;

// Environment variables.
const REGIONS_ENV: &str = "REGIONS";
const LOG_GROUP_ENV: &str = "CLOUDWATCH_LOG_GROUP";
const NAMESPACE_ENV: &str = "METRIC_NAMESPACE";
const FLUSH_INTERVAL_ENV: &str = "FLUSH_INTERVAL";
const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
const LAYER_PATH_ENV: &str = "LAMBDA_LAYER_PATH";
const SINK_ENDPOINT_ENV: &str = "SINK_ENDPOINT";
const SINK_HEADERS_ENV: &str = "SINK_HEADERS";

/// Seconds between periodic flushes when `FLUSH_INTERVAL` is unset.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(45);

/// Maximum records per staged batch.
pub const MAX_BATCH_EVENTS: usize = 10_000;

/// Maximum staged bytes per batch (1 MiB).
pub const MAX_BATCH_BYTES: usize = 1 << 20;

/// Worker pool size for quota collection.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Per-job execution deadline.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Process settings assembled from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub regions: Vec<String>,
    pub log_group: String,
    pub namespace: String,
    pub flush_interval: Duration,
    pub log_level: String,
    pub layer_path: Option<PathBuf>,
    pub sink_endpoint: String,
    pub sink_headers: HashMap<String, String>,
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through an injectable lookup, so tests never touch
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw_regions = lookup(REGIONS_ENV)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{REGIONS_ENV} is not set"))?;

        let regions: Vec<String> = raw_regions
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        if regions.is_empty() {
            bail!("{REGIONS_ENV} contains no regions");
        }

        let log_group = lookup(LOG_GROUP_ENV)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{LOG_GROUP_ENV} is not set"))?;

        let namespace = lookup(NAMESPACE_ENV)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{NAMESPACE_ENV} is not set"))?;

        let flush_interval = match lookup(FLUSH_INTERVAL_ENV) {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{FLUSH_INTERVAL_ENV} is not a number: {raw:?}"))?;
                Duration::from_secs(secs)
            }
            None => DEFAULT_FLUSH_INTERVAL,
        };

        let log_level = normalize_log_level(lookup(LOG_LEVEL_ENV).as_deref());

        let sink_endpoint = lookup(SINK_ENDPOINT_ENV)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{SINK_ENDPOINT_ENV} is not set"))?;

        let sink_headers = lookup(SINK_HEADERS_ENV)
            .map(|raw| parse_headers(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            regions,
            log_group,
            namespace,
            flush_interval,
            log_level,
            layer_path: lookup(LAYER_PATH_ENV).map(PathBuf::from),
            sink_endpoint,
            sink_headers,
        })
    }

    /// Connection settings for the HTTP sink client.
    pub fn sink_config(&self) -> HttpSinkConfig {
        HttpSinkConfig {
            endpoint: self.sink_endpoint.clone(),
            headers: self.sink_headers.clone(),
            ..Default::default()
        }
    }
}

/// Maps a raw log level to a supported one, defaulting to `info`.
pub fn normalize_log_level(raw: Option<&str>) -> String {
    match raw.map(|l| l.to_ascii_lowercase()).as_deref() {
        Some(level @ ("debug" | "info" | "warn" | "error")) => level.to_string(),
        _ => "info".to_string(),
    }
}

/// Parses `key=value,key=value` header pairs.
fn parse_headers(raw: &str) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            bail!("malformed header pair {pair:?} (expected key=value)");
        };
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

// --- Service catalogue ---

/// One enabled quota metric.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricRef {
    pub name: String,
}

/// One tracked rate-limited API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRef {
    pub name: String,
}

/// Per-service configuration. A service may carry quota metrics, rate
/// limit APIs, or both.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, rename = "quotaMetrics")]
    pub quota_metrics: Vec<MetricRef>,
    #[serde(default, rename = "rateLimitAPIs")]
    pub rate_limit_apis: Vec<ApiRef>,
}

/// The static catalogue naming services, enabled metrics, and regions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceCatalog {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

/// Quota metric names each known service may enable.
fn allowed_quota_metrics(service: &str) -> Option<&'static [&'static str]> {
    match service {
        "ec2" => Some(&["networkInterfaces"]),
        "eks" => Some(&["listClusters"]),
        "iam" => Some(&["iamRoles", "oidcProviders"]),
        "ebs" => Some(&["gp3storage"]),
        "vpc" => Some(&["nau"]),
        _ => None,
    }
}

/// Rate-limit API names each known service may track.
fn allowed_rate_limit_apis(service: &str) -> Option<&'static [&'static str]> {
    match service {
        "sts" => Some(&["assumeRole", "assumeRoleWithWebIdentity"]),
        _ => None,
    }
}

impl ServiceCatalog {
    /// Loads and validates the catalogue from a JSON document.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading service catalogue {}", path.display()))?;

        let catalog: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing service catalogue {}", path.display()))?;

        catalog.validate()?;
        info!(
            services = catalog.services.len(),
            regions = catalog.regions.len(),
            "service catalogue loaded",
        );

        Ok(catalog)
    }

    /// Checks every enabled metric and API name against its service's
    /// allowed set. Unknown services are warned and ignored.
    pub fn validate(&self) -> Result<()> {
        for (service, cfg) in &self.services {
            match allowed_quota_metrics(service) {
                Some(allowed) => {
                    for metric in &cfg.quota_metrics {
                        if !allowed.contains(&metric.name.as_str()) {
                            bail!("invalid {service} quota metric: {}", metric.name);
                        }
                    }
                }
                None if !cfg.quota_metrics.is_empty() => {
                    warn!(service = %service, "no quota config for service, ignoring");
                }
                None => {}
            }

            match allowed_rate_limit_apis(service) {
                Some(allowed) => {
                    for api in &cfg.rate_limit_apis {
                        if !allowed.contains(&api.name.as_str()) {
                            bail!("invalid {service} rate limit api: {}", api.name);
                        }
                    }
                }
                None if !cfg.rate_limit_apis.is_empty() => {
                    warn!(service = %service, "no rate limit config for service, ignoring");
                }
                None => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    const BASE_ENV: &[(&str, &str)] = &[
        ("REGIONS", "us-east-1,eu-west-1"),
        ("CLOUDWATCH_LOG_GROUP", "quotas"),
        ("METRIC_NAMESPACE", "Quotas"),
        ("SINK_ENDPOINT", "https://logs.example.com"),
    ];

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(env(BASE_ENV)).expect("settings");
        assert_eq!(settings.regions, vec!["us-east-1", "eu-west-1"]);
        assert_eq!(settings.flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(settings.log_level, "info");
        assert!(settings.layer_path.is_none());
        assert!(settings.sink_headers.is_empty());
    }

    #[test]
    fn test_settings_missing_regions() {
        let err = Settings::from_lookup(env(&BASE_ENV[1..])).unwrap_err();
        assert!(err.to_string().contains("REGIONS"));
    }

    #[test]
    fn test_settings_missing_log_group() {
        let pairs = [
            ("REGIONS", "us-east-1"),
            ("METRIC_NAMESPACE", "Quotas"),
            ("SINK_ENDPOINT", "https://logs.example.com"),
        ];
        let err = Settings::from_lookup(env(&pairs)).unwrap_err();
        assert!(err.to_string().contains("CLOUDWATCH_LOG_GROUP"));
    }

    #[test]
    fn test_settings_flush_interval_override() {
        let mut pairs = BASE_ENV.to_vec();
        pairs.push(("FLUSH_INTERVAL", "5"));
        let settings = Settings::from_lookup(env(&pairs)).expect("settings");
        assert_eq!(settings.flush_interval, Duration::from_secs(5));

        let mut pairs = BASE_ENV.to_vec();
        pairs.push(("FLUSH_INTERVAL", "soon"));
        assert!(Settings::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn test_settings_headers_parse() {
        let mut pairs = BASE_ENV.to_vec();
        pairs.push(("SINK_HEADERS", "x-api-key=abc, x-tenant=ops"));
        let settings = Settings::from_lookup(env(&pairs)).expect("settings");
        assert_eq!(settings.sink_headers.get("x-api-key").unwrap(), "abc");
        assert_eq!(settings.sink_headers.get("x-tenant").unwrap(), "ops");

        let mut pairs = BASE_ENV.to_vec();
        pairs.push(("SINK_HEADERS", "justakey"));
        assert!(Settings::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn test_normalize_log_level() {
        assert_eq!(normalize_log_level(Some("DEBUG")), "debug");
        assert_eq!(normalize_log_level(Some("warn")), "warn");
        assert_eq!(normalize_log_level(Some("verbose")), "info");
        assert_eq!(normalize_log_level(None), "info");
    }

    #[test]
    fn test_catalog_valid_config() {
        let raw = r#"{
            "regions": ["us-east-1"],
            "services": {
                "ec2": {"quotaMetrics": [{"name": "networkInterfaces"}]},
                "iam": {"quotaMetrics": [{"name": "iamRoles"}, {"name": "oidcProviders"}]},
                "sts": {"rateLimitAPIs": [{"name": "assumeRole"}]}
            }
        }"#;
        let catalog: ServiceCatalog = serde_json::from_str(raw).expect("parse");
        catalog.validate().expect("valid");
    }

    #[test]
    fn test_catalog_invalid_metric() {
        let raw = r#"{"services": {"ec2": {"quotaMetrics": [{"name": "elasticIps"}]}}}"#;
        let catalog: ServiceCatalog = serde_json::from_str(raw).expect("parse");
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("ec2"));
        assert!(err.to_string().contains("elasticIps"));
    }

    #[test]
    fn test_catalog_invalid_rate_limit_api() {
        let raw = r#"{"services": {"sts": {"rateLimitAPIs": [{"name": "getCallerIdentity"}]}}}"#;
        let catalog: ServiceCatalog = serde_json::from_str(raw).expect("parse");
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_catalog_unknown_service_is_ignored() {
        let raw = r#"{"services": {"dynamodb": {"quotaMetrics": [{"name": "tables"}]}}}"#;
        let catalog: ServiceCatalog = serde_json::from_str(raw).expect("parse");
        catalog.validate().expect("unknown services are warned, not fatal");
    }

    #[test]
    fn test_catalog_empty_document() {
        let catalog: ServiceCatalog = serde_json::from_str("{}").expect("parse");
        catalog.validate().expect("empty catalogue is valid");
        assert!(catalog.services.is_empty());
    }
}
