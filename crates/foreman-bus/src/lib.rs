//! Inter-agent message bus.
//!
//! Typed, addressed message delivery with three patterns:
//! fire-and-forget [`MessageBus::send`], correlated [`MessageBus::request`]
//! with a timeout, and [`MessageBus::broadcast`]. Every message is appended
//! to an immutable history before delivery.
//!
//! # Main types
//!
//! - [`Message`] — An immutable envelope with a closed [`MessageKind`].
//! - [`MessageBus`] — Cheaply clonable handle to the shared bus.
//! - [`Mailbox`] — Async, priority-ordered inbox for one agent.

/// The bus itself: subscriptions, delivery queues, history, requests.
pub mod bus;
/// Async per-agent inboxes backed by bus subscriptions.
pub mod mailbox;
/// Message envelope types.
pub mod message;

pub use bus::{MessageBus, MessageHandler, MessageSink, SubscriptionId};
pub use mailbox::Mailbox;
pub use message::{Message, MessageKind, MessagePriority, Recipient};
