use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of message types exchanged between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Coordinator hands a task to an executing agent.
    Assignment,
    /// Executing agent submits finished work for review.
    Submission,
    /// Reviewer asks for changes.
    Feedback,
    /// Work approved or a task finished.
    Completion,
    /// Something failed.
    Error,
    /// Status update for every subscriber.
    Broadcast,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Assignment => write!(f, "assignment"),
            MessageKind::Submission => write!(f, "submission"),
            MessageKind::Feedback => write!(f, "feedback"),
            MessageKind::Completion => write!(f, "completion"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Delivery priority. High-priority messages jump ahead of queued
/// normal-priority messages to the same recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Regular FIFO delivery.
    #[default]
    Normal,
    /// Interrupt-style delivery.
    High,
}

/// Addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single agent identifier.
    Agent(String),
    /// Every subscriber.
    All,
}

impl Recipient {
    /// Whether a subscriber registered as `agent_id` receives this message.
    pub fn matches(&self, agent_id: &str) -> bool {
        match self {
            Recipient::Agent(id) => id == agent_id,
            Recipient::All => true,
        }
    }

    /// Queue key for this recipient.
    pub(crate) fn key(&self) -> &str {
        match self {
            Recipient::Agent(id) => id,
            Recipient::All => "*",
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{id}"),
            Recipient::All => write!(f, "*"),
        }
    }
}

/// An immutable message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Message type.
    pub kind: MessageKind,
    /// Sending agent.
    pub from: String,
    /// Addressee.
    pub to: Recipient,
    /// Links a request to its response.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Whether the sender waits for a correlated response.
    #[serde(default)]
    pub requires_response: bool,
    /// Delivery priority.
    #[serde(default)]
    pub priority: MessagePriority,
    /// Arbitrary structured payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message addressed to a single agent.
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from: from.into(),
            to: Recipient::Agent(to.into()),
            correlation_id: None,
            requires_response: false,
            priority: MessagePriority::Normal,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Create a [`MessageKind::Broadcast`] message addressed to every subscriber.
    pub fn broadcast(from: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            to: Recipient::All,
            ..Self::new(MessageKind::Broadcast, from, String::new(), payload)
        }
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Build the correlated response to this message.
    ///
    /// The reply goes back to the original sender and never itself requires
    /// a response.
    pub fn reply(
        &self,
        from: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Message {
        let mut reply = Message::new(kind, from, self.from.clone(), payload);
        reply.correlation_id = self.correlation_id;
        reply.priority = self.priority;
        reply
    }

    /// Whether a subscriber registered as `agent_id` receives this message.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.to.matches(agent_id)
    }

    /// Whether this message answers a pending request.
    pub fn is_response(&self) -> bool {
        self.correlation_id.is_some() && !self.requires_response
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> ForemanResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ForemanError::Delivery(format!(
                "{} message {} has an unexpected payload: {e}",
                self.kind, self.id
            ))
        })
    }
}
