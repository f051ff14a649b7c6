//! Queue state machine.
//!
//! A `Queue` decides, for every message addressed to it, whether the message
//! goes to a subscriber now, waits in the in-memory backlog, or is written to
//! the durable store. Durable queues keep a cached copy of their persisted
//! range index; the cache is only replaced after the store accepted the
//! matching batch, so the two never drift apart.
//!
//! Durable indices handed to a connection that still owes an ack are *leased*:
//! they stay in the store (and in the index) until the ack arrives, but a
//! flush skips them so the same record is not offered twice.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use tracing::{debug, error, warn};

use crate::broker::index;
use crate::broker::message::{IdAllocator, Message};
use crate::client::{AckRecord, Connection, ConnectionId, Connections, DeliverStatus};
use crate::persistence::{DeclarationType, QueueIndex, Store};
use crate::utils::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Broadcast,
    Transient,
    Durable,
    /// Transient queue that lives as long as the connection that made it.
    Ephemeral,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Broadcast => "broadcast",
            QueueKind::Transient => "transient",
            QueueKind::Durable => "durable",
            QueueKind::Ephemeral => "ephemeral",
        }
    }

    /// How this kind is written to `"!config"`. Ephemeral queues are never
    /// declared.
    pub fn declaration(self) -> Option<DeclarationType> {
        match self {
            QueueKind::Broadcast => Some(DeclarationType::Broadcast),
            QueueKind::Transient => Some(DeclarationType::Transient),
            QueueKind::Durable => Some(DeclarationType::Durable),
            QueueKind::Ephemeral => None,
        }
    }
}

impl From<DeclarationType> for QueueKind {
    fn from(decl: DeclarationType) -> Self {
        match decl {
            DeclarationType::Broadcast => QueueKind::Broadcast,
            DeclarationType::Transient => QueueKind::Transient,
            DeclarationType::Durable => QueueKind::Durable,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`Queue::deliver`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A subscriber took it.
    Delivered,
    /// Nobody took it; it is in the backlog or the store.
    Held,
    /// Written to this many broadcast subscribers.
    Broadcast(usize),
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    kind: QueueKind,
    store: Store,
    backlog: VecDeque<Message>,
    subscribers: Vec<ConnectionId>,
    rotation: usize,
    index: QueueIndex,
    leased: BTreeSet<u64>,
    broadcasts_into: Vec<String>,
    bonded_from: Vec<String>,
    owner: Option<ConnectionId>,
}

impl Queue {
    /// Create a queue of `kind`. Durable queues reserve their index record and
    /// pick up whatever the store already holds for `name`.
    pub fn open(name: &str, kind: QueueKind, store: Store) -> Result<Self> {
        let mut queue = Self::open_in_memory(name, kind, store);
        if kind == QueueKind::Durable {
            queue.load_index()?;
        }
        Ok(queue)
    }

    pub fn ephemeral(name: &str, owner: ConnectionId, store: Store) -> Self {
        Self {
            owner: Some(owner),
            ..Self::open_in_memory(name, QueueKind::Ephemeral, store)
        }
    }

    fn open_in_memory(name: &str, kind: QueueKind, store: Store) -> Self {
        Self {
            name: name.to_string(),
            kind,
            store,
            backlog: VecDeque::new(),
            subscribers: Vec::new(),
            rotation: 0,
            index: QueueIndex::default(),
            leased: BTreeSet::new(),
            broadcasts_into: Vec::new(),
            bonded_from: Vec::new(),
            owner: None,
        }
    }

    fn load_index(&mut self) -> Result<()> {
        self.store.reserve(&self.name)?;
        self.index = self.store.read_queue(&self.name)?.unwrap_or_default();
        if !index::is_consistent(&self.index) {
            error!("Queue '{}' has an inconsistent index: {:?}", self.name, self.index);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn backlog(&self) -> impl Iterator<Item = &Message> {
        self.backlog.iter()
    }

    /// Live messages in the store; always 0 for non-durable queues.
    pub fn durable_size(&self) -> u64 {
        self.index.size
    }

    pub fn durable_index(&self) -> &QueueIndex {
        &self.index
    }

    pub fn subscribers(&self) -> &[ConnectionId] {
        &self.subscribers
    }

    pub fn broadcasts_into(&self) -> &[String] {
        &self.broadcasts_into
    }

    pub fn bonded_from(&self) -> &[String] {
        &self.bonded_from
    }

    pub fn subscribe(&mut self, id: ConnectionId) {
        if !self.subscribers.contains(&id) {
            self.subscribers.push(id);
        }
    }

    pub fn unsubscribe(&mut self, id: ConnectionId) {
        if let Some(pos) = self.subscribers.iter().position(|s| *s == id) {
            self.subscribers.remove(pos);
            if pos < self.rotation {
                self.rotation -= 1;
            }
            if self.rotation >= self.subscribers.len() {
                self.rotation = 0;
            }
        }
    }

    /// Fan publishes of this queue out into `target` as well.
    pub fn bond(&mut self, target: &str) {
        if !self.broadcasts_into.iter().any(|t| t == target) {
            self.broadcasts_into.push(target.to_string());
        }
    }

    pub fn bonded_by(&mut self, source: &str) {
        if !self.bonded_from.iter().any(|s| s == source) {
            self.bonded_from.push(source.to_string());
        }
    }

    /// Drop any link to or from `other`.
    pub fn forget(&mut self, other: &str) {
        self.broadcasts_into.retain(|t| t != other);
        self.bonded_from.retain(|s| s != other);
    }

    /// Route `msg` to one subscriber, or hold it.
    pub fn deliver(&mut self, msg: &Message, conns: &mut Connections, ids: &mut IdAllocator) -> Disposition {
        if self.kind == QueueKind::Broadcast {
            return Disposition::Broadcast(self.broadcast(msg, conns));
        }

        let n = self.subscribers.len();
        if n > 0 {
            let first = self.rotation % n;
            let mut pos = first;
            loop {
                let id = self.subscribers[pos];
                if let Some(conn) = conns.get_mut(&id) {
                    let status = conn.deliver(msg, self, ids);
                    if status.accepted() {
                        self.rotation = (pos + 1) % n;
                        self.settle(msg, status);
                        return Disposition::Delivered;
                    }
                }
                pos = (pos + 1) % n;
                if pos == first {
                    break;
                }
            }
            debug!("All {n} subscribers of '{}' refused, holding", self.name);
        }

        self.hold(msg);
        Disposition::Held
    }

    /// Write `msg` to every subscriber, ignoring kind, acks and storage.
    pub fn broadcast(&self, msg: &Message, conns: &Connections) -> usize {
        let frame = msg.encode();
        let mut written = 0;
        for id in &self.subscribers {
            match conns.get(id) {
                Some(conn) if conn.send(frame.clone()) => written += 1,
                Some(_) => warn!("Broadcast on '{}' to {id} failed", self.name),
                None => warn!("Subscriber {id} of '{}' is not connected", self.name),
            }
        }
        written
    }

    /// Keep `msg` for later: backlog for in-memory kinds, store for durable.
    pub fn hold(&mut self, msg: &Message) {
        match self.kind {
            QueueKind::Broadcast => {}
            QueueKind::Transient | QueueKind::Ephemeral => self.backlog.push_back(msg.clone()),
            QueueKind::Durable => {
                if let Some(slot) = msg.durable() {
                    // already stored; a flush will find it again
                    self.leased.remove(&slot.index);
                    return;
                }
                if let Err(e) = self.write_durable(msg) {
                    warn!("Unable to store message for '{}', keeping it in memory: {e}", self.name);
                    self.backlog.push_back(msg.clone());
                }
            }
        }
    }

    /// Hand up to `count` held messages to `conn`. Returns how many it took.
    pub fn flush_at_most(&mut self, conn: &mut Connection, count: usize, ids: &mut IdAllocator) -> usize {
        if self.kind == QueueKind::Broadcast {
            return 0;
        }

        let mut sent = 0;
        while sent < count {
            let Some(msg) = self.backlog.front().cloned() else {
                break;
            };
            let status = conn.deliver(&msg, self, ids);
            if !status.accepted() {
                if let Some(slot) = msg.durable().filter(|_| self.kind == QueueKind::Durable) {
                    // the attempt stored it; the store copy is the one to flush
                    self.backlog.pop_front();
                    self.leased.remove(&slot.index);
                }
                return sent;
            }
            self.backlog.pop_front();
            self.settle(&msg, status);
            sent += 1;
        }

        if self.kind != QueueKind::Durable || sent >= count {
            return sent;
        }

        let pending: Vec<u64> = index::indices(&self.index)
            .filter(|i| !self.leased.contains(i))
            .take(count - sent)
            .collect();
        for idx in pending {
            if sent >= count {
                break;
            }
            let key = Store::message_key(&self.name, idx);
            let wire = match self.store.read_message(&key) {
                Ok(Some(wire)) => wire,
                Ok(None) => {
                    error!("Index of '{}' is inconsistent: {key} is missing", self.name);
                    continue;
                }
                Err(e) => {
                    error!("Unable to read {key}: {e}");
                    continue;
                }
            };
            let msg = Message::stored(wire, key, idx);
            let status = conn.deliver(&msg, self, ids);
            if !status.accepted() {
                self.leased.remove(&idx);
                break;
            }
            self.settle(&msg, status);
            sent += 1;
        }
        sent
    }

    /// A consumer took `msg`. Non-acked durable records are done with now.
    fn settle(&mut self, msg: &Message, status: DeliverStatus) {
        if status != DeliverStatus::Consumed || self.kind != QueueKind::Durable {
            return;
        }
        if let Some(slot) = msg.durable() {
            self.leased.remove(&slot.index);
            match self.erase_durable(slot.index) {
                Ok(()) => msg.make_transient(),
                Err(e) => warn!("Unable to erase delivered message {} of '{}': {e}", slot.key, self.name),
            }
        }
    }

    /// A connection accepted a message from this queue and will wait for its
    /// ack. Durable queues make sure it is on disk while in flight.
    pub fn recorded_ack(&mut self, rec: &AckRecord) -> Result<()> {
        match self.kind {
            QueueKind::Transient | QueueKind::Ephemeral => Ok(()),
            QueueKind::Broadcast => {
                error!("unreachable: ack recorded on broadcast queue '{}'", self.name);
                Err(Error::Inconsistent(format!(
                    "broadcast queue '{}' does not track acks",
                    self.name
                )))
            }
            QueueKind::Durable => {
                let index = match rec.message.durable() {
                    Some(slot) => slot.index,
                    None => self.write_durable(&rec.message)?,
                };
                self.leased.insert(index);
                Ok(())
            }
        }
    }

    /// The client acknowledged `rec`.
    pub fn acked(&mut self, rec: &AckRecord) -> Result<()> {
        match self.kind {
            QueueKind::Transient | QueueKind::Ephemeral => Ok(()),
            QueueKind::Broadcast => {
                error!("unreachable: ack on broadcast queue '{}'", self.name);
                Err(Error::Inconsistent(format!(
                    "ack on broadcast queue '{}'",
                    self.name
                )))
            }
            QueueKind::Durable => {
                let Some(slot) = rec.message.durable() else {
                    if rec.kind != QueueKind::Durable {
                        // handed out before the queue became durable
                        return Ok(());
                    }
                    error!("inconsistent: ack of a non-durable message on durable queue '{}'", self.name);
                    return Err(Error::Inconsistent(format!(
                        "ack of a non-durable message on durable queue '{}'",
                        self.name
                    )));
                };
                self.leased.remove(&slot.index);
                self.erase_durable(slot.index)?;
                rec.message.make_transient();
                Ok(())
            }
        }
    }

    /// Change the kind of this queue. Only Transient → Durable is allowed,
    /// and it only takes effect once every backlog message is on disk.
    pub fn change_kind(&mut self, kind: QueueKind) -> Result<()> {
        if kind == self.kind {
            return Ok(());
        }
        match (self.kind, kind) {
            (QueueKind::Transient, QueueKind::Durable) => {
                self.load_index()?;
                self.flush_to_durable()?;
                self.kind = QueueKind::Durable;
                debug!("Queue '{}' is now durable", self.name);
                Ok(())
            }
            (from, to) => Err(Error::KindChange {
                queue: self.name.clone(),
                from: from.as_str(),
                to: to.as_str(),
            }),
        }
    }

    /// Write every backlog message to the store. Stops at the first failure
    /// and leaves the backlog untouched, so the call can be retried.
    pub fn flush_to_durable(&mut self) -> Result<()> {
        let backlog: Vec<Message> = self.backlog.iter().cloned().collect();
        for msg in &backlog {
            if msg.is_durable() {
                continue;
            }
            self.write_durable(msg)?;
        }
        self.backlog.clear();
        Ok(())
    }

    /// Append `msg` to the store at the next free index.
    pub fn write_durable(&mut self, msg: &Message) -> Result<u64> {
        let mut next = self.index.clone();
        let idx = index::append(&mut next);
        let key = Store::message_key(&self.name, idx);
        self.store.append_message(&self.name, &next, &key, &msg.encode())?;
        self.index = next;
        msg.make_durable(key, idx);
        Ok(idx)
    }

    /// Delete the record at `idx` from the store and the index.
    pub fn erase_durable(&mut self, idx: u64) -> Result<()> {
        let mut next = self.index.clone();
        if let Err(e) = index::erase(&mut next, idx) {
            error!("inconsistent: erase of {idx} on '{}': {e}", self.name);
            return Err(e);
        }
        let key = Store::message_key(&self.name, idx);
        self.store.remove_message(&self.name, &next, &key)?;
        self.index = next;
        Ok(())
    }
}

#[cfg(test)]
impl Queue {
    pub(crate) fn lease_count(&self) -> usize {
        self.leased.len()
    }
}
