//! Build manifest and worker configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Prefix of every cache generation name.
pub const CACHE_PREFIX: &str = "cache-";

/// What the build tooling hands the worker: a version token plus the
/// built artifacts and static files to precache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Deployment version token.
    pub version: String,

    /// Paths of built artifacts (e.g. `/_app/immutable/...`).
    #[serde(default)]
    pub build: Vec<String>,

    /// Paths of static files (e.g. `/favicon.png`).
    #[serde(default)]
    pub files: Vec<String>,
}

impl BuildManifest {
    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::Manifest(e.to_string()))?;
        if manifest.version.is_empty() {
            return Err(ServiceWorkerError::Manifest(
                "version must not be empty".to_string(),
            ));
        }
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// Name of the cache generation for this build.
    pub fn cache_name(&self) -> String {
        format!("{}{}", CACHE_PREFIX, self.version)
    }

    /// Build artifacts followed by static files.
    pub fn precache_assets(&self) -> Vec<String> {
        self.build.iter().chain(self.files.iter()).cloned().collect()
    }
}

/// Immutable configuration of one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Origin the precache paths resolve against.
    pub scope: Url,

    /// Active cache generation name.
    pub cache_name: String,

    /// Precache asset paths, in manifest order.
    pub assets: Vec<String>,
}

impl WorkerConfig {
    /// Derive the configuration from a build manifest.
    pub fn from_manifest(manifest: &BuildManifest, scope: Url) -> Self {
        Self {
            scope,
            cache_name: manifest.cache_name(),
            assets: manifest.precache_assets(),
        }
    }

    /// Whether `path` belongs to the precache set.
    pub fn is_precached(&self, path: &str) -> bool {
        self.assets.iter().any(|asset| asset == path)
    }

    /// Absolute URL of a precache path.
    pub fn asset_url(&self, path: &str) -> Result<Url> {
        self.scope
            .join(path)
            .map_err(|e| ServiceWorkerError::Manifest(format!("{}: {}", path, e)))
    }
}
