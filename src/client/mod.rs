//! The `client` module defines the broker-side state of a connected client.
//!
//! It provides the `Connection` struct, which holds the client's delivery
//! modes, its subscriptions and the table of in-flight messages waiting for
//! an ack, plus the channel the transport drains to write frames to the socket.

pub mod connection;
pub use connection::{AckRecord, Connection, ConnectionId, DeliverStatus};

use std::collections::HashMap;

/// Every connection the broker currently routes to.
pub type Connections = HashMap<ConnectionId, Connection>;
