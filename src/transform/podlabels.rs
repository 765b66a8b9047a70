//! Pod label enrichment: an allowlist-driven filter over pod metadata labels
//! fetched from the Kubernetes API.

use super::lru::LruCache;
use crate::error::{ExporterError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Decisions are memoized per distinct label key up to this many entries.
pub const LABEL_FILTER_CACHE_CAPACITY: usize = 1000;

/// Rewrites a pod label key into a valid Prometheus label name. Every
/// character outside `[A-Za-z0-9_]` becomes an underscore.
pub fn sanitize_label_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Allowlist over pod label keys. An empty pattern list admits everything
/// and keeps no cache; otherwise match results are held in a bounded LRU so
/// steady-state scrapes skip the regex walk.
pub struct LabelFilter {
    patterns: Vec<Regex>,
    cache: Option<Mutex<LruCache<String, bool>>>,
}

impl fmt::Debug for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelFilter")
            .field("patterns", &self.patterns.len())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl LabelFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        let cache = if patterns.is_empty() {
            None
        } else {
            Some(Mutex::new(LruCache::new(LABEL_FILTER_CACHE_CAPACITY)))
        };
        Self { patterns, cache }
    }

    pub fn allow_all() -> Self {
        Self::new(Vec::new())
    }

    pub fn from_patterns(patterns: &[String]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ExporterError::Config(format!("bad pod label allowlist pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(compiled))
    }

    pub fn allows(&self, key: &str) -> bool {
        let Some(cache) = &self.cache else {
            return true;
        };
        let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(verdict) = cache.get(&key.to_string()) {
            return *verdict;
        }
        let verdict = self.patterns.iter().any(|p| p.is_match(key));
        cache.put(key.to_string(), verdict);
        verdict
    }

    #[cfg(test)]
    fn cached_entries(&self) -> usize {
        self.cache
            .as_ref()
            .map(|c| c.lock().unwrap().len())
            .unwrap_or(0)
    }
}

/// Where pod labels come from. The production implementation talks to the
/// Kubernetes API server; tests substitute a canned map.
#[async_trait]
pub trait PodLabelSource: Send + Sync {
    async fn pod_labels(&self, namespace: &str, pod: &str) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Deserialize)]
struct PodObject {
    metadata: PodMetadata,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// In-cluster Kubernetes API client reading pod metadata over HTTPS with the
/// service-account bearer token.
pub struct KubeApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl KubeApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ExporterError::Enrichment(format!("kubernetes api client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Builds a client from the standard in-cluster environment: the
    /// `KUBERNETES_SERVICE_HOST`/`_PORT` variables and the mounted
    /// service-account token.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ExporterError::Config("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| ExporterError::Config("KUBERNETES_SERVICE_PORT not set".to_string()))?;
        let token =
            std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/token")
                .map_err(|e| ExporterError::Config(format!("service account token: {e}")))?;
        Self::new(format!("https://{host}:{port}"), token.trim())
    }
}

#[async_trait]
impl PodLabelSource for KubeApiClient {
    async fn pod_labels(&self, namespace: &str, pod: &str) -> Result<BTreeMap<String, String>> {
        let url = format!("{}/api/v1/namespaces/{namespace}/pods/{pod}", self.base_url);
        let object: PodObject = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ExporterError::Enrichment(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| ExporterError::Enrichment(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| ExporterError::Enrichment(format!("decode pod {namespace}/{pod}: {e}")))?;
        Ok(object.metadata.labels)
    }
}
