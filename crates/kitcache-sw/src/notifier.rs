//! Page-side update prompt.
//!
//! Watches registration events. Once a scope has an active worker, a newly
//! installed version that ends up waiting triggers a confirmation prompt;
//! on acceptance the waiting worker is told to skip waiting and the page
//! reloads.

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{MessageOutcome, WorkerMessage};
use crate::registration::{ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState};
use crate::Result;

/// Text of the update confirmation.
pub const UPDATE_PROMPT: &str = "New update available. Reload to update?";

/// The page the notifier runs in.
pub trait PageHost: Send + Sync {
    /// Ask the user a yes/no question.
    fn confirm(&self, message: &str) -> bool;

    /// Reload the page.
    fn reload(&self);
}

/// Delivers messages to a specific worker.
#[async_trait]
pub trait WorkerMessenger: Send + Sync {
    async fn post_to_worker(
        &self,
        scope: &str,
        worker: ServiceWorkerId,
        data: JsonValue,
    ) -> Result<MessageOutcome>;
}

/// What the notifier did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierAction {
    /// Nothing to do.
    None,
    /// The user declined the update.
    Declined,
    /// The update was handed over and the page reloaded.
    Updated,
}

/// Prompts for and applies worker updates.
pub struct UpdateNotifier<M, P> {
    messenger: M,
    page: P,
    /// Scopes that already have an active worker.
    ready: HashSet<String>,
    /// Installing worker per ready scope.
    installing: HashMap<String, ServiceWorkerId>,
}

impl<M: WorkerMessenger, P: PageHost> UpdateNotifier<M, P> {
    pub fn new(messenger: M, page: P) -> Self {
        Self {
            messenger,
            page,
            ready: HashSet::new(),
            installing: HashMap::new(),
        }
    }

    /// The page host.
    pub fn page(&self) -> &P {
        &self.page
    }

    /// React to one registration event.
    pub async fn handle_event(&mut self, event: &ServiceWorkerEvent) -> Result<NotifierAction> {
        match event {
            ServiceWorkerEvent::UpdateFound {
                registration_scope,
                worker_id,
            } => {
                if self.ready.contains(registration_scope) {
                    debug!(scope = %registration_scope, worker = %worker_id, "Update found");
                    self.installing
                        .insert(registration_scope.clone(), *worker_id);
                }
                Ok(NotifierAction::None)
            }
            ServiceWorkerEvent::StateChange {
                registration_scope,
                worker_id,
                new_state,
            } => match new_state {
                ServiceWorkerState::Activated => {
                    self.ready.insert(registration_scope.clone());
                    Ok(NotifierAction::None)
                }
                ServiceWorkerState::Installed
                    if self.installing.get(registration_scope) == Some(worker_id) =>
                {
                    self.installing.remove(registration_scope);
                    self.prompt(registration_scope, *worker_id).await
                }
                ServiceWorkerState::Redundant
                    if self.installing.get(registration_scope) == Some(worker_id) =>
                {
                    self.installing.remove(registration_scope);
                    Ok(NotifierAction::None)
                }
                _ => Ok(NotifierAction::None),
            },
            ServiceWorkerEvent::ControllerChange { .. } => Ok(NotifierAction::None),
        }
    }

    async fn prompt(&self, scope: &str, worker: ServiceWorkerId) -> Result<NotifierAction> {
        if !self.page.confirm(UPDATE_PROMPT) {
            info!(scope = %scope, worker = %worker, "Update declined");
            return Ok(NotifierAction::Declined);
        }

        self.messenger
            .post_to_worker(scope, worker, WorkerMessage::SkipWaiting.to_value())
            .await?;
        info!(scope = %scope, worker = %worker, "Update accepted, reloading");
        self.page.reload();
        Ok(NotifierAction::Updated)
    }

    /// Process events until the channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(&event).await {
                warn!(error = %e, "Update handoff failed");
            }
        }
    }
}
