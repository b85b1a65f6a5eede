use crate::mailbox::Mailbox;
use crate::message::{Message, MessageKind, MessagePriority};
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A delivery target registered with [`MessageBus::subscribe`].
///
/// Handlers run synchronously on the delivering thread and must not block.
/// Long work should be handed off (see [`Mailbox`]).
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message. Errors are logged by the bus and never
    /// stop delivery to other handlers.
    fn handle(&self, message: &Message) -> ForemanResult<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> ForemanResult<()> + Send + Sync,
{
    fn handle(&self, message: &Message) -> ForemanResult<()> {
        self(message)
    }
}

/// Receives a copy of every message appended to the history
/// (e.g. a per-run event log).
pub trait MessageSink: Send + Sync {
    /// Record one message. Must not fail the send.
    fn record(&self, message: &Message);
}

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    agent_id: String,
    handler: Arc<dyn MessageHandler>,
}

/// Two-lane FIFO: high-priority messages are popped before normal ones.
#[derive(Default)]
pub(crate) struct PriorityQueue {
    high: VecDeque<Message>,
    normal: VecDeque<Message>,
}

impl PriorityQueue {
    pub(crate) fn push(&mut self, message: Message) {
        match message.priority {
            MessagePriority::High => self.high.push_back(message),
            MessagePriority::Normal => self.normal.push_back(message),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

#[derive(Default)]
struct DeliveryState {
    queues: HashMap<String, PriorityQueue>,
    /// Recipients with queued messages, served round-robin.
    rotation: VecDeque<String>,
    draining: bool,
}

struct BusInner {
    subscribers: RwLock<Vec<Subscription>>,
    delivery: Mutex<DeliveryState>,
    history: Mutex<Vec<Message>>,
    requests: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    abandoned: Mutex<Vec<Uuid>>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    next_subscription: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Addressed message bus with an append-only history.
///
/// Cloning is cheap; all clones share the same subscribers and history.
///
/// Delivery is synchronous: a `send` on an idle bus delivers to every
/// matching handler before returning. Sends issued while a delivery pass is
/// already running (including sends from inside a handler) are queued per
/// recipient and delivered by that pass, high priority first. Messages for
/// the same (sender, recipient) pair and priority are delivered in send order.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                delivery: Mutex::new(DeliveryState::default()),
                history: Mutex::new(Vec::new()),
                requests: Mutex::new(HashMap::new()),
                abandoned: Mutex::new(Vec::new()),
                sink: RwLock::new(None),
                next_subscription: AtomicU64::new(1),
                delivery_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Mirror every sent message into `sink`.
    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    /// Register a closure as a delivery target for `agent_id`.
    pub fn subscribe<F>(&self, agent_id: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) -> ForemanResult<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(agent_id, Arc::new(handler))
    }

    /// Register a shared handler as a delivery target for `agent_id`.
    pub fn subscribe_handler(
        &self,
        agent_id: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        let agent_id = agent_id.into();
        debug!(agent = %agent_id, subscription = id.0, "Bus: subscribed");
        self.inner.subscribers.write().push(Subscription {
            id,
            agent_id,
            handler,
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Open an async inbox for `agent_id`.
    pub fn mailbox(&self, agent_id: impl Into<String>) -> Mailbox {
        Mailbox::open(self.clone(), agent_id.into())
    }

    /// Number of subscriptions registered for `agent_id`.
    pub fn subscriber_count(&self, agent_id: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .count()
    }

    /// Persist `message` to the history, then deliver it.
    ///
    /// Returns the message id. A message with no subscribers is recorded and
    /// otherwise dropped.
    pub fn send(&self, message: Message) -> ForemanResult<Uuid> {
        if message.from.is_empty() {
            return Err(ForemanError::Delivery(format!(
                "{} message {} has no sender",
                message.kind, message.id
            )));
        }
        if message.to.key().is_empty() {
            return Err(ForemanError::Delivery(format!(
                "{} message {} has no recipient",
                message.kind, message.id
            )));
        }

        let id = message.id;
        self.inner.history.lock().push(message.clone());
        if let Some(sink) = self.inner.sink.read().as_ref() {
            sink.record(&message);
        }

        if message.is_response() {
            self.resolve_request(&message);
        }

        if self.enqueue(message) {
            self.drain();
        }
        Ok(id)
    }

    /// Send a broadcast status update to every subscriber.
    pub fn broadcast(
        &self,
        from: impl Into<String>,
        payload: serde_json::Value,
    ) -> ForemanResult<Uuid> {
        self.send(Message::broadcast(from, payload))
    }

    /// Send `request` and wait for the first message carrying its
    /// correlation identifier.
    ///
    /// A correlation identifier is generated when the message has none. If
    /// no response arrives within `timeout` the request is abandoned and
    /// [`ForemanError::ResponseTimeout`] is returned; a response arriving
    /// later is recorded in the history but resolves nothing.
    pub async fn request(&self, mut request: Message, timeout: Duration) -> ForemanResult<Message> {
        let correlation_id = *request.correlation_id.get_or_insert_with(Uuid::new_v4);
        request.requires_response = true;

        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().insert(correlation_id, tx);

        if let Err(e) = self.send(request) {
            self.inner.requests.lock().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.abandon(correlation_id);
                Err(ForemanError::Delivery(format!(
                    "request {correlation_id} was dropped before a response arrived"
                )))
            }
            Err(_) => {
                self.abandon(correlation_id);
                warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Bus: request abandoned after timeout"
                );
                Err(ForemanError::ResponseTimeout {
                    correlation_id: correlation_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send the correlated response to `request`.
    pub fn respond(
        &self,
        request: &Message,
        from: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> ForemanResult<Uuid> {
        if request.correlation_id.is_none() {
            return Err(ForemanError::Delivery(format!(
                "cannot respond to message {}: it carries no correlation id",
                request.id
            )));
        }
        self.send(request.reply(from, kind, payload))
    }

    /// Full message history in send order.
    pub fn history(&self) -> Vec<Message> {
        self.inner.history.lock().clone()
    }

    /// Messages sent from `from` to the agent `to`, in send order.
    pub fn history_between(&self, from: &str, to: &str) -> Vec<Message> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|m| m.from == from && m.to.key() == to)
            .cloned()
            .collect()
    }

    /// Number of messages sent so far.
    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    /// Correlation ids of requests that timed out.
    pub fn abandoned_requests(&self) -> Vec<Uuid> {
        self.inner.abandoned.lock().clone()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Number of handler invocations that returned an error or panicked.
    pub fn delivery_failures(&self) -> u64 {
        self.inner.delivery_failures.load(Ordering::SeqCst)
    }

    fn resolve_request(&self, response: &Message) {
        let Some(cid) = response.correlation_id else {
            return;
        };
        if let Some(tx) = self.inner.requests.lock().remove(&cid) {
            // The requester may have given up between the lookup and now.
            let _ = tx.send(response.clone());
        }
    }

    fn abandon(&self, correlation_id: Uuid) {
        self.inner.requests.lock().remove(&correlation_id);
        self.inner.abandoned.lock().push(correlation_id);
    }

    /// Queue a message; returns `true` if the caller must run the delivery pass.
    fn enqueue(&self, message: Message) -> bool {
        let mut guard = self.inner.delivery.lock();
        let state = &mut *guard;
        let key = message.to.key().to_string();
        let queue = state.queues.entry(key.clone()).or_default();
        let was_idle = queue.is_empty();
        queue.push(message);
        if was_idle {
            state.rotation.push_back(key);
        }
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    /// Next queued message, or `None` after clearing the draining flag.
    fn next_queued(&self) -> Option<Message> {
        let mut guard = self.inner.delivery.lock();
        let state = &mut *guard;
        while let Some(key) = state.rotation.pop_front() {
            if let Some(queue) = state.queues.get_mut(&key) {
                if let Some(message) = queue.pop() {
                    if queue.is_empty() {
                        state.queues.remove(&key);
                    } else {
                        state.rotation.push_back(key);
                    }
                    return Some(message);
                }
            }
        }
        state.draining = false;
        None
    }

    fn drain(&self) {
        while let Some(message) = self.next_queued() {
            self.deliver(&message);
        }
    }

    fn deliver(&self, message: &Message) {
        let targets: Vec<(String, Arc<dyn MessageHandler>)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|s| message.is_for(&s.agent_id))
            .map(|s| (s.agent_id.clone(), s.handler.clone()))
            .collect();

        if targets.is_empty() {
            debug!(
                msg_id = %message.id,
                kind = %message.kind,
                to = %message.to,
                "Bus: no subscribers, message recorded only"
            );
            return;
        }

        for (agent_id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.inner.delivery_failures.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        msg_id = %message.id,
                        kind = %message.kind,
                        agent = %agent_id,
                        error = %e,
                        "Bus: handler failed"
                    );
                }
                Err(_) => {
                    self.inner.delivery_failures.fetch_add(1, Ordering::SeqCst);
                    error!(
                        msg_id = %message.id,
                        kind = %message.kind,
                        agent = %agent_id,
                        "Bus: handler panicked"
                    );
                }
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
