//! Fakes shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use kitcache_net::{NetError, Network, Request, Response};
use url::Url;

use crate::{BuildManifest, WorkerConfig};

pub const ORIGIN: &str = "https://app.example.com/";

/// Canned responses keyed by URL, with an offline switch and a call log.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    /// Serve `body` with `status` for `path`.
    pub fn route(&self, path: &str, status: StatusCode, body: &str) {
        let url = Self::url(path);
        let response = Response::new(url.clone(), status, body.to_string());
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    /// Serve a prepared response for an absolute URL.
    pub fn route_response(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(request.url.to_string());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let routes = self.routes.lock().unwrap();
        match routes.get(request.url.as_str()) {
            Some(response) => Ok(response.clone()),
            None => Err(NetError::RequestFailed(format!(
                "connection refused: {}",
                request.url
            ))),
        }
    }
}

/// A manifest with two build artifacts and one static file.
pub fn manifest(version: &str) -> BuildManifest {
    BuildManifest {
        version: version.to_string(),
        build: vec![
            "/_app/immutable/start.js".to_string(),
            "/_app/immutable/app.css".to_string(),
        ],
        files: vec!["/favicon.png".to_string()],
    }
}

pub fn config(version: &str) -> WorkerConfig {
    WorkerConfig::from_manifest(&manifest(version), Url::parse(ORIGIN).unwrap())
}

/// A network serving every asset of [`manifest`].
pub fn network_with_assets() -> FakeNetwork {
    let network = FakeNetwork::new();
    network.route("/_app/immutable/start.js", StatusCode::OK, "start()");
    network.route("/_app/immutable/app.css", StatusCode::OK, "body{}");
    network.route("/favicon.png", StatusCode::OK, "png");
    network
}
