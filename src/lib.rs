//! # harq
//!
//! `harq` is a message broker with durable queues. Clients speak a
//! length-prefixed protobuf protocol over TCP: they declare queues, publish to
//! a destination, subscribe, and may require per-message acks, publish
//! confirmations or broadcast fan-out. A second broker can follow this one as
//! a live replica.
//!
//! ## Core Modules
//!
//! - `broker`: queues, connections and routing between them.
//! - `client`: the broker-side state of one connected client.
//! - `config`: loading and merging the server configuration.
//! - `persistence`: the sled-backed store and its on-disk records.
//! - `transport`: wire records, the TCP server and the replica link.
//! - `fsck`: offline consistency check of a store.
//! - `utils`: the shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod fsck;
pub mod persistence;
pub mod transport;
pub mod utils;
