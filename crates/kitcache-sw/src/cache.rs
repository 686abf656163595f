//! Named cache stores keyed by request URL.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use kitcache_net::{Request, Response, ResponseKind};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Cache storage shared between the worker's handlers.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// Cache key for a URL. Fragments never take part in matching.
fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    #[serde(default)]
    pub status_text: String,

    /// Response headers in wire order. Repeated names keep every value.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Build an entry from a request and its response.
    pub fn new(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: cache_key(&request.url),
            method: request.method.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", self.url, e)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            body: self.body.clone().into(),
            kind: ResponseKind::Basic,
        })
    }
}

// ==================== Cache ====================

/// A cache instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(url))
    }

    /// Match a request. Only GET requests can match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.match_url(&request.url)
    }

    /// Store `response` under `request`, replacing any previous entry.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<()> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        if !response.is_well_formed() {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache network error for {}",
                request.url
            )));
        }

        let entry = CacheEntry::new(request, response);
        debug!(cache = %self.name, url = %entry.url, status = entry.status, "Cache put");
        self.entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(url)).is_some()
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All named caches of one origin.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the storage for sharing.
    pub fn shared(self) -> SharedCacheStorage {
        Arc::new(RwLock::new(self))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Load storage from a JSON snapshot.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let storage: Self = serde_json::from_slice(&data)
            .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), caches = storage.caches.len(), "Cache storage loaded");
        Ok(storage)
    }

    /// Write storage to a JSON snapshot.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data =
            serde_json::to_vec(self).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
        tokio::fs::write(path, data).await?;
        info!(path = %path.display(), caches = self.caches.len(), "Cache storage saved");
        Ok(())
    }
}
