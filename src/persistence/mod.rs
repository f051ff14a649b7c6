//! The `persistence` module provides the durable store behind durable queues
//! and the persisted queue declarations.
//!
//! It is layered in two parts:
//!
//! - [`KvStore`]: the raw ordered key/value engine contract (`get`, `put`,
//!   `delete` and atomic multi-key [`WriteBatch`] writes), implemented for
//!   `sled` by [`SledKv`].
//! - [`Store`]: the broker's key layout on top of it (the `"!config"`
//!   declaration list, one `"-queue"` range index per durable queue and one
//!   `"-queue:index"` record per stored message).

pub mod records;
pub mod sled_store;

pub use records::{DeclarationType, MessageRange, QueueConfiguration, QueueDeclaration, QueueIndex};
pub use sled_store::{BatchOp, KvStore, SledKv, Store, WriteBatch};

#[cfg(test)]
pub(crate) mod testing;
