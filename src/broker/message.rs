//! Message envelope shared by queues, connections and fan-out.
//!
//! A `Message` is a cheap handle: cloning it shares the same decoded wire
//! record. The wire record never changes after construction; the only
//! mutable part is the durability slot, which records whether (and under
//! which index) this exact instance is stored by its durable queue. The ack
//! path reads it to decide between "write, then erase on ack" and "only erase
//! on ack".

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use prost::Message as _;

use crate::transport::message::WireMessage;
use crate::utils::Result;

/// Where a message is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableSlot {
    pub key: String,
    pub index: u64,
}

#[derive(Debug)]
struct Inner {
    wire: WireMessage,
    durable: Mutex<Option<DurableSlot>>,
}

#[derive(Debug, Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    pub fn new(wire: WireMessage) -> Self {
        Self(Arc::new(Inner {
            wire,
            durable: Mutex::new(None),
        }))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(WireMessage::decode(bytes)?))
    }

    /// A message read back from durable storage.
    pub fn stored(wire: WireMessage, key: String, index: u64) -> Self {
        let msg = Self::new(wire);
        msg.make_durable(key, index);
        msg
    }

    pub fn destination(&self) -> &str {
        &self.0.wire.destination
    }

    pub fn payload(&self) -> &Bytes {
        &self.0.wire.payload
    }

    /// Producer-chosen confirmation id; 0 when the producer sent none.
    pub fn confirm_id(&self) -> u64 {
        self.0.wire.confirm_id.unwrap_or(0)
    }

    fn slot(&self) -> MutexGuard<'_, Option<DurableSlot>> {
        self.0.durable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn durable(&self) -> Option<DurableSlot> {
        self.slot().clone()
    }

    pub fn is_durable(&self) -> bool {
        self.slot().is_some()
    }

    pub fn make_durable(&self, key: String, index: u64) {
        *self.slot() = Some(DurableSlot { key, index });
    }

    pub fn make_transient(&self) {
        *self.slot() = None;
    }

    /// Encoded wire record, as stored and as sent to subscribers without acks.
    pub fn encode(&self) -> Bytes {
        self.0.wire.to_bytes()
    }

    /// Encoded copy carrying the server-assigned ack id.
    pub fn encode_with_id(&self, id: u64) -> Bytes {
        let mut wire = self.0.wire.clone();
        wire.id = Some(id);
        wire.to_bytes()
    }

}

/// Source of server-assigned message ids. Ids start at 1 and only grow.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    pub fn next_id(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}
