//! Client connection state
//!
//! `Connection` models one connected socket from the broker's point of view:
//! the sending side of the per-socket channel the transport drains, the
//! delivery modes the client asked for, and the table of messages handed to
//! it that still wait for an `Ack`.
//!
//! `deliver` is the contract queues rely on for back-pressure: a connection
//! that requires acks and already holds `inflight_max` unacknowledged messages
//! answers [`DeliverStatus::Ignored`], which makes a queue move on to the next
//! subscriber or stop flushing.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::{IdAllocator, Message};
use crate::broker::queue::{Queue, QueueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Answer of [`Connection::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    /// Not taken: closing, out of inflight capacity, or the write failed.
    Ignored,
    /// Written; the message stays in flight until the client acks it.
    WaitForAck,
    /// Written; nothing further is owed.
    Consumed,
}

impl DeliverStatus {
    pub fn accepted(self) -> bool {
        !matches!(self, DeliverStatus::Ignored)
    }
}

/// An in-flight message and the queue it must go back to if never acked.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub message: Message,
    pub queue: String,
    /// Kind of `queue` when the message was handed out.
    pub kind: QueueKind,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    sender: UnboundedSender<Bytes>,
    pub tap: bool,
    pub ack_required: bool,
    pub confirm_required: bool,
    pub replica: bool,
    pub inflight_max: usize,
    pub subscriptions: Vec<String>,
    /// Ephemeral queues created by this connection.
    pub owned_queues: Vec<String>,
    unacked: BTreeMap<u64, AckRecord>,
    closing: bool,
}

impl Connection {
    pub const DEFAULT_INFLIGHT: usize = 1;

    /// Create a connection writing frames into `sender`.
    pub fn new(sender: UnboundedSender<Bytes>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
            tap: false,
            ack_required: false,
            confirm_required: false,
            replica: false,
            inflight_max: Self::DEFAULT_INFLIGHT,
            subscriptions: Vec::new(),
            owned_queues: Vec::new(),
            unacked: BTreeMap::new(),
            closing: false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_awaiting(&self, id: u64) -> bool {
        self.unacked.contains_key(&id)
    }

    /// How many more messages this connection will take right now.
    pub fn capacity(&self) -> usize {
        if self.closing {
            0
        } else if self.ack_required {
            self.inflight_max.saturating_sub(self.unacked.len())
        } else {
            usize::MAX
        }
    }

    /// Queue an encoded frame for the socket. False once the socket is gone.
    pub fn send(&self, frame: Bytes) -> bool {
        if self.closing {
            return false;
        }
        self.sender.send(frame).is_ok()
    }

    /// Offer `msg`, which comes from `from`, to this connection.
    pub fn deliver(&mut self, msg: &Message, from: &mut Queue, ids: &mut IdAllocator) -> DeliverStatus {
        if self.closing {
            return DeliverStatus::Ignored;
        }

        if !self.ack_required {
            return if self.send(msg.encode()) {
                DeliverStatus::Consumed
            } else {
                DeliverStatus::Ignored
            };
        }

        if self.unacked.len() >= self.inflight_max {
            return DeliverStatus::Ignored;
        }

        let id = ids.next_id();
        debug!("Assign message id {id} for {}", self.id);

        let rec = AckRecord {
            message: msg.clone(),
            queue: from.name().to_string(),
            kind: from.kind(),
        };

        if let Err(e) = from.recorded_ack(&rec) {
            warn!("Unable to persist in-flight message {id} for '{}': {e}", rec.queue);
        }

        if !self.send(msg.encode_with_id(id)) {
            debug!("Write to {} failed, refusing message {id}", self.id);
            return DeliverStatus::Ignored;
        }

        self.unacked.insert(id, rec);
        DeliverStatus::WaitForAck
    }

    /// Remove and return the record for `id`.
    pub fn clear_ack(&mut self, id: u64) -> Option<AckRecord> {
        self.unacked.remove(&id)
    }

    /// Every still-unacknowledged message, oldest id first.
    pub fn take_unacked(&mut self) -> Vec<(u64, AckRecord)> {
        std::mem::take(&mut self.unacked).into_iter().collect()
    }
}
