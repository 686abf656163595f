//! # kitcache service worker
//!
//! The offline asset cache of a single-page web app, driven by service
//! worker lifecycle events.
//!
//! ## Features
//!
//! - **Precache**: every build artifact and static file is stored at install
//! - **Generation eviction**: activation deletes every store from older builds
//! - **Fetch interception**: cache-first for precached assets,
//!   network-first with cache fallback for everything else
//! - **Update handoff**: a waiting worker can be told to skip waiting
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     └── ServiceWorkerRegistration (per scope)
//!             ├── installing ─┐
//!             ├── waiting     ├── Arc<dyn LifecycleHandler>
//!             └── active ─────┘        │
//!                                      └── CacheWorker
//!                                              ├── AssetCacheManager (install, activate)
//!                                              └── FetchInterceptor  (fetch)
//!
//! CacheStorage (shared)
//!     └── Cache "cache-{version}"
//!             └── URL → CacheEntry
//!
//! UpdateNotifier (page side)
//!     ├── consumes ServiceWorkerEvent
//!     └── posts {"action": "SKIP_WAITING"}
//! ```

use kitcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod events;
pub mod interceptor;
pub mod manager;
pub mod notifier;
pub mod registration;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, CacheEntry, CacheStorage, SharedCacheStorage};
pub use config::{BuildManifest, WorkerConfig};
pub use events::{
    dispatch, EventOutcome, ExtendableEvent, FetchDecision, FetchEvent, LifecycleEvent,
    LifecycleHandler, MessageEvent, MessageOutcome, ResponseSource, WorkerMessage,
};
pub use interceptor::FetchInterceptor;
pub use manager::AssetCacheManager;
pub use notifier::{NotifierAction, PageHost, UpdateNotifier, WorkerMessenger, UPDATE_PROMPT};
pub use registration::{
    RegistrationState, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use worker::CacheWorker;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Invalid response from fetch: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
