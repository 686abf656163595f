//! Worker registrations and the lifecycle state machine.
//!
//! The container installs a new worker version, parks it as *waiting*
//! while an older version still controls pages, and hands control over
//! on activation. Every transition is published as a
//! [`ServiceWorkerEvent`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::events::{FetchDecision, FetchEvent, LifecycleHandler, MessageEvent, MessageOutcome};
use crate::notifier::WorkerMessenger;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script loaded.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    handler: Arc<dyn LifecycleHandler>,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .finish()
    }
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, handler: Arc<dyn LifecycleHandler>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            handler,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// The worker's event handler.
    pub fn handler(&self) -> Arc<dyn LifecycleHandler> {
        Arc::clone(&self.handler)
    }
}

// ==================== Registration ====================

/// Worker ids currently held by a registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationState {
    pub installing: Option<ServiceWorkerId>,
    pub waiting: Option<ServiceWorkerId>,
    pub active: Option<ServiceWorkerId>,
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Snapshot of the worker ids.
    pub fn state(&self) -> RegistrationState {
        RegistrationState {
            installing: self.installing.as_ref().map(|w| w.id),
            waiting: self.waiting.as_ref().map(|w| w.id),
            active: self.active.as_ref().map(|w| w.id),
        }
    }

    /// Start installing a new worker. Returns the worker it replaces, if an
    /// install was already in flight.
    pub fn update(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        self.installing.replace(worker).map(redundant)
    }

    /// Transition installing to waiting. Returns the previous waiting
    /// worker, which is now redundant.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<Option<ServiceWorker>> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Installed);
        Ok(self.waiting.replace(worker).map(redundant))
    }

    /// Discard the installing worker after a failed install.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker> {
        self.take_installing(id).map(redundant)
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(format!(
                    "{} is not installing",
                    id
                )))
            }
        }
    }

    /// Mark the waiting worker as activating. Returns `None` when its
    /// activation is already under way.
    pub fn begin_activation(&mut self) -> Result<Option<&ServiceWorker>> {
        let worker = self.waiting.as_mut().ok_or_else(|| {
            ServiceWorkerError::StateError("no waiting worker to activate".to_string())
        })?;
        if worker.state == ServiceWorkerState::Activating {
            return Ok(None);
        }
        worker.set_state(ServiceWorkerState::Activating);
        Ok(Some(&*worker))
    }

    /// Promote the waiting worker to active. Returns the worker it
    /// replaced, which is now redundant.
    pub fn activate(&mut self, id: ServiceWorkerId) -> Result<Option<ServiceWorker>> {
        let mut worker = match self.waiting.take() {
            Some(worker) if worker.id == id => worker,
            other => {
                self.waiting = other;
                return Err(ServiceWorkerError::StateError(format!(
                    "{} is not waiting",
                    id
                )));
            }
        };

        worker.set_state(ServiceWorkerState::Activated);
        Ok(self.active.replace(worker).map(redundant))
    }

    /// Mark every worker redundant.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .flatten()
            .map(redundant)
            .collect()
    }

    fn find(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }
}

fn redundant(mut worker: ServiceWorker) -> ServiceWorker {
    worker.set_state(ServiceWorkerState::Redundant);
    worker
}

/// Default scope: the directory holding the script.
fn scope_for(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let path = script_url.path();
    let dir = path.rfind('/').map(|i| &path[..=i]).unwrap_or("/");
    scope.set_path(dir);
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

// ==================== Events ====================

/// Registration lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound {
        registration_scope: String,
        worker_id: ServiceWorkerId,
    },
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker took control of the scope's pages.
    ControllerChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Container ====================

/// Hosts registrations and drives their workers' lifecycle events.
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id,
            new_state: worker.state,
        });
    }

    /// Register a worker script and run its install.
    ///
    /// The first worker of a scope is activated as soon as it installs.
    /// Later versions stay waiting until skip-waiting or an explicit
    /// [`activate`](Self::activate). Returns the scope.
    pub async fn register(
        &self,
        script_url: &str,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Result<String> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let scope = scope_for(&script_url);
        let scope_str = scope.to_string();

        let worker = ServiceWorker::new(script_url, Arc::clone(&handler));
        let worker_id = worker.id;
        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));

            if let Some(replaced) = registration.update(worker) {
                self.emit_state(&scope_str, &replaced);
            }
            self.emit(ServiceWorkerEvent::UpdateFound {
                registration_scope: scope_str.clone(),
                worker_id,
            });
            if let Some(ref installing) = registration.installing {
                self.emit_state(&scope_str, installing);
            }
        }

        info!(scope = %scope_str, worker = %worker_id, "Installing service worker");
        let installed = handler.on_install().await;

        let first_install = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;

            if let Err(e) = installed {
                warn!(scope = %scope_str, worker = %worker_id, error = %e, "Install failed");
                if let Ok(discarded) = registration.install_failed(worker_id) {
                    self.emit_state(&scope_str, &discarded);
                }
                return Err(e);
            }

            if let Some(replaced) = registration.install_complete(worker_id)? {
                self.emit_state(&scope_str, &replaced);
            }
            if let Some(ref waiting) = registration.waiting {
                self.emit_state(&scope_str, waiting);
            }
            registration.active.is_none()
        };

        if first_install {
            self.activate(&scope_str).await?;
        }

        Ok(scope_str)
    }

    /// Activate the waiting worker of `scope`.
    ///
    /// The worker's activate handler runs to completion before it takes
    /// control. A failing handler is logged and does not block activation.
    pub async fn activate(&self, scope: &str) -> Result<()> {
        self.run_activation(scope, None).await
    }

    /// Activate the waiting worker, optionally only if it is `expected`.
    ///
    /// A worker that is already activating, or that is no longer the
    /// waiting one, is left alone.
    async fn run_activation(&self, scope: &str, expected: Option<ServiceWorkerId>) -> Result<()> {
        let (worker_id, handler) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

            if let Some(id) = expected {
                if registration.waiting.as_ref().map(|w| w.id) != Some(id) {
                    debug!(scope = %scope, worker = %id, "Worker no longer waiting");
                    return Ok(());
                }
            }
            let Some(worker) = registration.begin_activation()? else {
                debug!(scope = %scope, "Activation already in progress");
                return Ok(());
            };
            self.emit_state(scope, worker);
            (worker.id, worker.handler())
        };

        if let Err(e) = handler.on_activate().await {
            warn!(scope = %scope, worker = %worker_id, error = %e, "Activate handler failed");
        }

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

        if let Some(replaced) = registration.activate(worker_id)? {
            self.emit_state(scope, &replaced);
        }
        if let Some(ref active) = registration.active {
            self.emit_state(scope, active);
        }
        self.emit(ServiceWorkerEvent::ControllerChange {
            registration_scope: scope.to_string(),
            worker_id,
        });

        info!(scope = %scope, worker = %worker_id, "Service worker activated");
        Ok(())
    }

    /// Deliver a message to a worker of `scope`.
    ///
    /// When `worker` is `None` the waiting worker receives it, else the
    /// active one. A waiting worker that asks to skip waiting is activated
    /// before this returns.
    pub async fn post_message(
        &self,
        scope: &str,
        worker: Option<ServiceWorkerId>,
        data: JsonValue,
    ) -> Result<MessageOutcome> {
        let (target, handler, is_waiting) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

            let target = match worker {
                Some(id) => registration.find(id),
                None => registration.waiting.as_ref().or(registration.active.as_ref()),
            }
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker in {}", scope)))?;

            let is_waiting = registration.waiting.as_ref().map(|w| w.id) == Some(target.id);
            (target.id, target.handler(), is_waiting)
        };

        let outcome = handler.on_message(&MessageEvent::new(data)).await;

        if outcome == MessageOutcome::SkipWaiting && is_waiting {
            info!(scope = %scope, worker = %target, "Skipping wait");
            self.run_activation(scope, Some(target)).await?;
        }

        Ok(outcome)
    }

    /// Find the registration whose scope covers `url`. The longest scope wins.
    pub async fn get_registration(&self, url: &Url) -> Option<String> {
        let registrations = self.registrations.read().await;
        registrations
            .keys()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Worker ids held by the registration of `scope`.
    pub async fn registration_state(&self, scope: &str) -> Option<RegistrationState> {
        self.registrations.read().await.get(scope).map(|r| r.state())
    }

    /// Route a fetch to the active worker controlling the request's URL.
    ///
    /// Requests outside every scope, or in a scope without an active
    /// worker, pass through.
    pub async fn handle_fetch(&self, event: &mut FetchEvent) -> Result<FetchDecision> {
        let handler = {
            let Some(scope) = self.get_registration(&event.request.url).await else {
                return Ok(FetchDecision::Passthrough);
            };
            let registrations = self.registrations.read().await;
            match registrations.get(&scope).and_then(|r| r.active.as_ref()) {
                Some(active) => active.handler(),
                None => return Ok(FetchDecision::Passthrough),
            }
        };

        handler.on_fetch(event).await
    }

    /// Unregister a scope. Returns whether it existed.
    pub async fn unregister(&self, scope: &str) -> bool {
        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope) {
            Some(mut registration) => {
                for worker in registration.unregister() {
                    self.emit_state(scope, &worker);
                }
                info!(scope = %scope, "Service worker unregistered");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerMessenger for ServiceWorkerContainer {
    async fn post_to_worker(
        &self,
        scope: &str,
        worker: ServiceWorkerId,
        data: JsonValue,
    ) -> Result<MessageOutcome> {
        self.post_message(scope, Some(worker), data).await
    }
}
