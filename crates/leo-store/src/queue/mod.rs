//! Queue transport abstraction.
//!
//! The engine pushes change events as opaque strings and pulls them back as
//! leased messages. A lease hides the message from other consumers for the
//! transport's visibility timeout; completing it acknowledges and deletes,
//! abandoning (or dropping) it makes it visible again. Delivery is
//! at-least-once, so consumers must be idempotent.

mod memory;

pub use memory::MemoryQueue;

use async_trait::async_trait;

use crate::Result;

/// A message pulled under a server-side lease.
#[async_trait]
pub trait LeasedMessage: Send + Sync {
    /// The message body.
    fn body(&self) -> &str;

    /// Acknowledge and delete the message.
    async fn complete(&self) -> Result<()>;

    /// Give the message back to the queue for immediate redelivery.
    /// Dropping an unsettled message has the same effect.
    async fn abandon(&self) -> Result<()>;
}

/// A queue endpoint.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Push a message.
    async fn send_message(&self, body: String) -> Result<()>;

    /// Fetch up to `max` visible messages, each under a lease. Returns
    /// immediately; an empty result means the queue had nothing visible.
    async fn listen_for_next_message(&self, max: usize) -> Result<Vec<Box<dyn LeasedMessage>>>;

    /// Idempotent queue provisioning.
    async fn create_queue_if_not_exists(&self) -> Result<()>;

    /// Drop the queue and everything in it, if it exists.
    async fn delete_queue_if_exists(&self) -> Result<()>;
}
