//! The `broker` module holds the queue engine.
//!
//! - [`engine::Broker`] owns the queue namespace and the connection table and
//!   routes between them; [`handler`] decodes frames into broker calls.
//! - [`queue::Queue`] is the per-queue delivery state machine.
//! - [`index`] maintains the range index of durable queues.
//! - [`message::Message`] is the shared message envelope.

pub mod engine;
pub mod handler;
pub mod index;
pub mod message;
pub mod queue;

pub use engine::Broker;
pub use message::Message;
pub use queue::{Disposition, Queue, QueueKind};

#[cfg(test)]
mod tests;
