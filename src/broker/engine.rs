use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::broker::message::{IdAllocator, Message};
use crate::broker::queue::{Disposition, Queue, QueueKind};
use crate::client::{Connection, ConnectionId, Connections};
use crate::persistence::{DeclarationType, Store};
use crate::transport::message::{ConnectionConfigure, ReplicaAction, Stat};
use crate::utils::{Error, Result};

/// Owns the queue namespace and every connection, and routes between them.
///
/// All state lives behind one `&mut self`, so no two operations ever run at
/// the same time. Closing a connection happens in two steps: [`disconnect`]
/// takes it out of routing right away, [`cleanup`] later requeues what it
/// still held and drops it.
///
/// [`disconnect`]: Broker::disconnect
/// [`cleanup`]: Broker::cleanup
#[derive(Debug)]
pub struct Broker {
    pub(crate) queues: HashMap<String, Queue>,
    pub(crate) connections: Connections,
    closing: Vec<Connection>,
    taps: Vec<ConnectionId>,
    replicas: Vec<ConnectionId>,
    ids: IdAllocator,
    store: Store,
    implicit_queues: bool,
}

impl Broker {
    pub fn new(store: Store) -> Self {
        Self {
            queues: HashMap::new(),
            connections: HashMap::new(),
            closing: Vec::new(),
            taps: Vec::new(),
            replicas: Vec::new(),
            ids: IdAllocator::default(),
            store,
            implicit_queues: false,
        }
    }

    /// Create unknown queues as Transient on first publish or subscribe.
    pub fn with_implicit_queues(mut self, on: bool) -> Self {
        self.implicit_queues = on;
        self
    }

    /// Recreate every queue declared in the store.
    pub fn load(&mut self) -> Result<()> {
        for decl in self.store.read_declarations()? {
            let kind = DeclarationType::try_from(decl.r#type).map_err(|_| Error::Corrupt {
                key: crate::persistence::sled_store::CONFIG_KEY.to_string(),
                reason: format!("queue '{}' has unknown type {}", decl.name, decl.r#type),
            })?;
            let queue = Queue::open(&decl.name, kind.into(), self.store.clone())?;
            info!(
                "Loaded {} queue '{}' ({} stored)",
                queue.kind(),
                decl.name,
                queue.durable_size()
            );
            self.queues.insert(decl.name, queue);
        }
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_tap(&self, id: &ConnectionId) -> bool {
        self.taps.contains(id)
    }

    pub fn is_replica(&self, id: &ConnectionId) -> bool {
        self.replicas.contains(id)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Start routing for a new connection.
    pub fn register(&mut self, conn: Connection) -> ConnectionId {
        let id = conn.id;
        debug!("Registered {id}");
        self.connections.insert(id, conn);
        id
    }

    /// Declare `name` as `kind`, creating it or changing the kind of the
    /// existing queue. Ephemeral queues belong to `requester`.
    pub fn make_queue(&mut self, name: &str, kind: QueueKind, requester: Option<ConnectionId>) -> Result<()> {
        if name.is_empty() || name.starts_with('+') {
            return Err(Error::Protocol(format!("invalid queue name '{name}'")));
        }

        match self.queues.get_mut(name) {
            Some(queue) => {
                let was = queue.kind();
                queue.change_kind(kind)?;
                if was != kind && kind == QueueKind::Durable {
                    self.forward_reserve(name);
                }
            }
            None if kind == QueueKind::Ephemeral => {
                let owner = requester
                    .ok_or_else(|| Error::Protocol(format!("ephemeral queue '{name}' needs an owner")))?;
                let conn = self
                    .connections
                    .get_mut(&owner)
                    .ok_or_else(|| Error::Protocol(format!("owner of '{name}' is not connected")))?;
                conn.owned_queues.push(name.to_string());
                self.queues
                    .insert(name.to_string(), Queue::ephemeral(name, owner, self.store.clone()));
            }
            None => {
                if kind == QueueKind::Durable {
                    self.reserve(name)?;
                }
                let queue = Queue::open(name, kind, self.store.clone())?;
                self.queues.insert(name.to_string(), queue);
            }
        }

        if let Some(decl) = kind.declaration() {
            self.store.add_declaration(name, decl)?;
        }
        info!("Declared {kind} queue '{name}'");
        Ok(())
    }

    /// Make sure the durable index record of `name` exists, and tell every
    /// replica to do the same.
    pub fn reserve(&mut self, name: &str) -> Result<bool> {
        let created = self.store.reserve(name)?;
        self.forward_reserve(name);
        Ok(created)
    }

    fn forward_reserve(&mut self, name: &str) {
        let frame = ReplicaAction::reserve(name).into_message().to_bytes();
        self.feed_replicas(&frame);
    }

    /// Send `frame` to every replica, demoting the ones that cannot take it.
    fn feed_replicas(&mut self, frame: &Bytes) {
        for id in fan_out(&mut self.replicas, &self.connections, frame, "replica") {
            if let Some(c) = self.connections.get_mut(&id) {
                c.replica = false;
            }
        }
    }

    /// Also broadcast every publish on `source` to the subscribers of `target`.
    pub fn bond(&mut self, source: &str, target: &str) -> Result<()> {
        if source == target {
            return Err(Error::Protocol(format!("queue '{source}' cannot bond into itself")));
        }
        if !self.queues.contains_key(target) {
            return Err(Error::UnknownQueue(target.to_string()));
        }
        let Some(src) = self.queues.get_mut(source) else {
            return Err(Error::UnknownQueue(source.to_string()));
        };
        src.bond(target);
        if let Some(dst) = self.queues.get_mut(target) {
            dst.bonded_by(source);
        }
        debug!("Bonded '{source}' into '{target}'");
        Ok(())
    }

    fn ensure_queue(&mut self, name: &str) -> Result<()> {
        if self.queues.contains_key(name) {
            return Ok(());
        }
        if !self.implicit_queues || name.is_empty() || name.starts_with('+') {
            return Err(Error::UnknownQueue(name.to_string()));
        }
        debug!("Creating implicit queue '{name}'");
        let queue = Queue::open(name, QueueKind::Transient, self.store.clone())?;
        self.queues.insert(name.to_string(), queue);
        Ok(())
    }

    /// Route a published message: taps, then the queue, then bonded queues,
    /// then replicas.
    pub fn deliver(&mut self, msg: &Message) -> Result<Disposition> {
        let name = msg.destination().to_string();
        self.ensure_queue(&name)?;

        if !self.taps.is_empty() {
            let frame = msg.encode();
            for id in fan_out(&mut self.taps, &self.connections, &frame, "tap") {
                if let Some(c) = self.connections.get_mut(&id) {
                    c.tap = false;
                }
            }
        }

        let Some(queue) = self.queues.get_mut(&name) else {
            return Err(Error::UnknownQueue(name));
        };
        let disposition = queue.deliver(msg, &mut self.connections, &mut self.ids);
        let bonds = queue.broadcasts_into().to_vec();

        for target in bonds {
            match self.queues.get(&target) {
                Some(bonded) => {
                    bonded.broadcast(msg, &self.connections);
                }
                None => warn!("'{name}' is bonded to missing queue '{target}'"),
            }
        }

        if !self.replicas.is_empty() {
            let frame = msg.encode();
            self.feed_replicas(&frame);
        }

        debug!("Message for '{name}': {disposition:?}");
        Ok(disposition)
    }

    /// Join `conn` to `name` and hand it whatever the queue holds.
    pub fn subscribe(&mut self, conn: ConnectionId, name: &str) -> Result<usize> {
        self.ensure_queue(name)?;
        let Some(c) = self.connections.get_mut(&conn) else {
            return Ok(0);
        };
        if !c.subscriptions.iter().any(|s| s == name) {
            c.subscriptions.push(name.to_string());
        }
        if let Some(queue) = self.queues.get_mut(name) {
            queue.subscribe(conn);
        }
        debug!("{conn} subscribed to '{name}'");
        self.flush(conn, name)
    }

    /// Offer `conn` as many held messages of `name` as it can take.
    pub fn flush(&mut self, conn: ConnectionId, name: &str) -> Result<usize> {
        let Some(queue) = self.queues.get_mut(name) else {
            return Err(Error::UnknownQueue(name.to_string()));
        };
        let Some(c) = self.connections.get_mut(&conn) else {
            return Ok(0);
        };
        let room = c.capacity();
        if room == 0 {
            return Ok(0);
        }
        Ok(queue.flush_at_most(c, room, &mut self.ids))
    }

    /// Flush every subscription of `conn` until it runs out of capacity.
    pub fn flush_subscriptions(&mut self, conn: ConnectionId) -> usize {
        let Some(subs) = self.connections.get(&conn).map(|c| c.subscriptions.clone()) else {
            return 0;
        };
        let mut sent = 0;
        for name in subs {
            if self.connections.get(&conn).is_none_or(|c| c.capacity() == 0) {
                break;
            }
            match self.flush(conn, &name) {
                Ok(n) => sent += n,
                Err(e) => debug!("Skipping flush of '{name}' for {conn}: {e}"),
            }
        }
        sent
    }

    /// The client acknowledged message `id`.
    pub fn ack(&mut self, conn: ConnectionId, id: u64) {
        let Some(c) = self.connections.get_mut(&conn) else {
            return;
        };
        let Some(rec) = c.clear_ack(id) else {
            warn!("{conn} acked unknown message id {id}");
            return;
        };
        match self.queues.get_mut(&rec.queue) {
            Some(queue) => {
                if let Err(e) = queue.acked(&rec) {
                    warn!("Ack {id} on '{}' failed: {e}", rec.queue);
                }
            }
            None => debug!("Ack {id} for removed queue '{}'", rec.queue),
        }
        self.flush_subscriptions(conn);
    }

    /// Apply a `Configure` request. Absent fields keep their value.
    pub fn configure(&mut self, conn: ConnectionId, cfg: &ConnectionConfigure) {
        let Some(c) = self.connections.get_mut(&conn) else {
            return;
        };
        if let Some(ack) = cfg.ack {
            c.ack_required = ack;
        }
        if let Some(confirm) = cfg.confirm {
            c.confirm_required = confirm;
        }
        if let Some(inflight) = cfg.inflight {
            c.inflight_max = inflight as usize;
        }
        if let Some(tap) = cfg.tap {
            c.tap = tap;
            if tap && !self.taps.contains(&conn) {
                self.taps.push(conn);
            } else if !tap {
                self.taps.retain(|t| *t != conn);
            }
        }
        debug!("Configured {conn}: {cfg:?}");
    }

    /// `conn` is a replica: it gets a copy of everything from now on.
    pub fn start_replica(&mut self, conn: ConnectionId) {
        let Some(c) = self.connections.get_mut(&conn) else {
            return;
        };
        c.replica = true;
        if !self.replicas.contains(&conn) {
            self.replicas.push(conn);
        }
        info!("{conn} is now a replica");
    }

    pub fn stat(&self, name: &str) -> Stat {
        let clamp = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
        match self.queues.get(name) {
            None => Stat {
                name: name.to_string(),
                exists: false,
                transient_size: None,
                durable_size: None,
            },
            Some(queue) => Stat {
                name: name.to_string(),
                exists: true,
                transient_size: Some(clamp(queue.backlog_len() as u64)),
                durable_size: (queue.kind() == QueueKind::Durable).then(|| clamp(queue.durable_size())),
            },
        }
    }

    /// Write a frame to one connection. False if it is gone.
    pub fn send_to(&self, conn: ConnectionId, frame: Bytes) -> bool {
        self.connections.get(&conn).is_some_and(|c| c.send(frame))
    }

    /// First half of closing `conn`: stop routing to it. The rest happens in
    /// [`Broker::cleanup`].
    pub fn disconnect(&mut self, conn: ConnectionId) {
        let Some(mut c) = self.connections.remove(&conn) else {
            return;
        };
        c.mark_closing();
        for name in &c.subscriptions {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.unsubscribe(conn);
            }
        }
        self.taps.retain(|t| *t != conn);
        self.replicas.retain(|r| *r != conn);
        debug!("{conn} closing with {} unacked", c.unacked_len());
        self.closing.push(c);
    }

    /// Second half of closing: hand unacked messages back to their queues,
    /// then drop the ephemeral queues the closed connections owned.
    pub fn cleanup(&mut self) {
        for mut conn in std::mem::take(&mut self.closing) {
            for (id, rec) in conn.take_unacked() {
                match self.queues.get_mut(&rec.queue) {
                    Some(queue) => {
                        debug!("Requeue message {id} of {} into '{}'", conn.id, rec.queue);
                        queue.deliver(&rec.message, &mut self.connections, &mut self.ids);
                    }
                    None => debug!("Dropping message {id}: queue '{}' is gone", rec.queue),
                }
            }
            for name in &conn.owned_queues {
                self.destroy_queue(name);
            }
            info!("{} closed", conn.id);
        }
    }

    fn destroy_queue(&mut self, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };
        for other in queue.broadcasts_into().iter().chain(queue.bonded_from()) {
            if let Some(q) = self.queues.get_mut(other) {
                q.forget(name);
            }
        }
        for sub in queue.subscribers() {
            if let Some(c) = self.connections.get_mut(sub) {
                c.subscriptions.retain(|s| s != name);
            }
        }
        debug!("Destroyed {} queue '{name}'", queue.kind());
    }

    pub fn flush_store(&self) -> Result<()> {
        self.store.flush()
    }
}

/// Write `frame` to each listed connection and drop the ones that fail.
/// Returns the dropped ids.
fn fan_out(list: &mut Vec<ConnectionId>, conns: &Connections, frame: &Bytes, role: &str) -> Vec<ConnectionId> {
    let mut dropped = Vec::new();
    list.retain(|id| match conns.get(id) {
        Some(c) if c.send(frame.clone()) => true,
        _ => {
            warn!("Write to {role} {id} failed, removing it");
            dropped.push(*id);
            false
        }
    });
    dropped
}
