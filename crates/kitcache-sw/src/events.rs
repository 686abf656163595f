//! Lifecycle events and the handler interface they are dispatched to.

use std::future::Future;

use async_trait::async_trait;
use kitcache_net::{Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::Result;

// ==================== Extendable Event ====================

/// Background work an event keeps alive after its handler has returned.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
    pending: Vec<JoinHandle<()>>,
}

impl ExtendableEvent {
    /// Create an event with no pending work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` and tie it to this event's lifetime.
    pub fn wait_until<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.push(tokio::spawn(task));
    }

    /// Number of tasks not yet awaited.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every extension task to finish.
    pub async fn settled(&mut self) {
        for handle in self.pending.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event extension task failed");
            }
        }
    }
}

// ==================== Fetch ====================

/// An intercepted request.
#[derive(Debug)]
pub struct FetchEvent {
    /// The request being made.
    pub request: Request,

    lifetime: ExtendableEvent,
}

impl FetchEvent {
    /// Create a fetch event for `request`.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            lifetime: ExtendableEvent::new(),
        }
    }

    /// Keep `task` running past the response.
    pub fn wait_until<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lifetime.wait_until(task);
    }

    /// Number of pending extension tasks.
    pub fn pending(&self) -> usize {
        self.lifetime.pending()
    }

    /// Wait for background work started while handling this event.
    pub async fn settled(&mut self) {
        self.lifetime.settled().await;
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// What the worker decided for a fetch.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// Not intercepted; the default network behaviour applies.
    Passthrough,
    /// Respond with this response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchDecision {
    /// The response, if the request was intercepted.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchDecision::Passthrough => None,
            FetchDecision::Respond { response, .. } => Some(response),
        }
    }

    /// The response source, if the request was intercepted.
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchDecision::Passthrough => None,
            FetchDecision::Respond { source, .. } => Some(*source),
        }
    }
}

// ==================== Message ====================

/// A message posted to the worker.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Arbitrary payload.
    pub data: JsonValue,
}

impl MessageEvent {
    pub fn new(data: JsonValue) -> Self {
        Self { data }
    }
}

/// Control messages the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum WorkerMessage {
    /// Activate the waiting worker without waiting for clients to close.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl WorkerMessage {
    /// Recognise a control message. Any other shape yields `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    /// Encode as a message payload.
    pub fn to_value(self) -> JsonValue {
        match self {
            WorkerMessage::SkipWaiting => serde_json::json!({ "action": "SKIP_WAITING" }),
        }
    }
}

/// What the worker asks of the host after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Ignored,
    SkipWaiting,
}

// ==================== Handler ====================

/// One lifecycle event.
#[derive(Debug)]
pub enum LifecycleEvent<'a> {
    Install,
    Activate,
    Fetch(&'a mut FetchEvent),
    Message(&'a MessageEvent),
}

/// Result of handling a lifecycle event.
#[derive(Debug)]
pub enum EventOutcome {
    Completed,
    Fetch(FetchDecision),
    Message(MessageOutcome),
}

/// The worker script: one handler per lifecycle event type.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Prepare the worker. An error discards this worker version.
    async fn on_install(&self) -> Result<()>;

    /// Runs before the worker controls any page.
    async fn on_activate(&self) -> Result<()>;

    /// Decide how to answer a request.
    async fn on_fetch(&self, event: &mut FetchEvent) -> Result<FetchDecision>;

    /// React to a posted message.
    async fn on_message(&self, event: &MessageEvent) -> MessageOutcome;
}

/// Route `event` to the matching method of `handler`.
pub async fn dispatch(
    handler: &dyn LifecycleHandler,
    event: LifecycleEvent<'_>,
) -> Result<EventOutcome> {
    match event {
        LifecycleEvent::Install => handler.on_install().await.map(|_| EventOutcome::Completed),
        LifecycleEvent::Activate => handler.on_activate().await.map(|_| EventOutcome::Completed),
        LifecycleEvent::Fetch(event) => handler.on_fetch(event).await.map(EventOutcome::Fetch),
        LifecycleEvent::Message(event) => {
            Ok(EventOutcome::Message(handler.on_message(event).await))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_skip_waiting_message_parse() {
        assert_eq!(
            WorkerMessage::parse(&json!({ "action": "SKIP_WAITING" })),
            Some(WorkerMessage::SkipWaiting)
        );
        assert_eq!(
            WorkerMessage::parse(&json!({ "action": "SKIP_WAITING", "from": "page" })),
            Some(WorkerMessage::SkipWaiting)
        );
    }

    #[test]
    fn test_other_messages_are_not_recognised() {
        assert_eq!(WorkerMessage::parse(&json!({ "action": "RELOAD" })), None);
        assert_eq!(WorkerMessage::parse(&json!({ "type": "SKIP_WAITING" })), None);
        assert_eq!(WorkerMessage::parse(&json!("SKIP_WAITING")), None);
        assert_eq!(WorkerMessage::parse(&JsonValue::Null), None);
    }

    #[test]
    fn test_skip_waiting_encodes_action() {
        let value = WorkerMessage::SkipWaiting.to_value();
        assert_eq!(value, json!({ "action": "SKIP_WAITING" }));
        assert_eq!(WorkerMessage::parse(&value), Some(WorkerMessage::SkipWaiting));
    }

    #[tokio::test]
    async fn test_wait_until_settles() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);

        let request = Request::parse_get("https://example.com/").unwrap();
        let mut event = FetchEvent::new(request);
        event.wait_until(async move {
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(event.pending(), 1);

        event.settled().await;
        assert_eq!(event.pending(), 0);
        assert!(done.load(Ordering::SeqCst));
    }
}
