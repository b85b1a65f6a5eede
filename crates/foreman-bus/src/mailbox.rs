use crate::bus::{MessageBus, PriorityQueue, SubscriptionId};
use crate::message::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inbox {
    queue: Mutex<PriorityQueue>,
    notify: Notify,
}

/// Async inbox for one agent.
///
/// Messages addressed to the agent (and broadcasts) are queued as they are
/// delivered and handed out high priority first, FIFO within a priority.
/// Dropping the mailbox removes its subscription.
pub struct Mailbox {
    agent_id: String,
    bus: MessageBus,
    subscription: SubscriptionId,
    inbox: Arc<Inbox>,
}

impl Mailbox {
    pub(crate) fn open(bus: MessageBus, agent_id: String) -> Self {
        let inbox = Arc::new(Inbox::default());
        let target = inbox.clone();
        let subscription = bus.subscribe(agent_id.clone(), move |message: &Message| {
            target.queue.lock().push(message.clone());
            target.notify.notify_one();
            Ok(())
        });
        Self {
            agent_id,
            bus,
            subscription,
            inbox,
        }
    }

    /// The agent this mailbox receives for.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&self) -> Option<Message> {
        self.inbox.queue.lock().pop()
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> Message {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            self.inbox.notify.notified().await;
        }
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inbox.queue.lock().len()
    }

    /// Whether no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.inbox.queue.lock().is_empty()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, MessagePriority};

    fn msg(payload: &str) -> Message {
        Message::new(
            MessageKind::Assignment,
            "coordinator",
            "executor",
            serde_json::json!(payload),
        )
    }

    #[tokio::test]
    async fn test_mailbox_receives_in_priority_order() {
        let bus = MessageBus::new();
        let mailbox = bus.mailbox("executor");

        bus.send(msg("one")).unwrap();
        bus.send(msg("two")).unwrap();
        bus.send(msg("stop").with_priority(MessagePriority::High))
            .unwrap();
        assert_eq!(mailbox.len(), 3);

        assert_eq!(mailbox.recv().await.payload, serde_json::json!("stop"));
        assert_eq!(mailbox.recv().await.payload, serde_json::json!("one"));
        assert_eq!(mailbox.recv().await.payload, serde_json::json!("two"));
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let bus = MessageBus::new();
        let mailbox = bus.mailbox("executor");
        let sender = bus.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send(msg("late")).unwrap();
        });

        let received = mailbox.recv_timeout(Duration::from_secs(2)).await;
        assert_eq!(received.unwrap().payload, serde_json::json!("late"));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_expires() {
        let bus = MessageBus::new();
        let mailbox = bus.mailbox("executor");
        assert!(mailbox
            .recv_timeout(Duration::from_millis(100))
            .await
            .is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = MessageBus::new();
        {
            let _mailbox = bus.mailbox("executor");
            assert_eq!(bus.subscriber_count("executor"), 1);
        }
        assert_eq!(bus.subscriber_count("executor"), 0);
    }
}
