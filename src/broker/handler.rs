//! Frame dispatch: turns decoded frames from a connection into broker calls.

use bytes::Bytes;
use prost::Message as _;
use tracing::{debug, warn};

use crate::broker::engine::Broker;
use crate::broker::message::Message;
use crate::broker::queue::QueueKind;
use crate::client::ConnectionId;
use crate::transport::message::{
    Action, ActionType, BondRequest, CONTROL_DEST, ConnectionConfigure, QueueError, REPLICA_DEST,
    ReplicaAction, ReplicaActionType, STAT_DEST, WireMessage,
};
use crate::utils::Result;

impl Broker {
    /// Handle one raw frame read from `conn`.
    ///
    /// An error means the frame was not a message at all; the caller closes
    /// the connection. Everything else, including bad actions and unknown
    /// queues, is answered on the control channel.
    pub fn handle_frame(&mut self, conn: ConnectionId, frame: &[u8]) -> Result<()> {
        let msg = Message::decode(frame)?;
        match msg.destination() {
            CONTROL_DEST => self.handle_action(conn, msg.payload()),
            REPLICA_DEST => self.handle_replica(conn, msg.payload()),
            _ => self.handle_publish(conn, &msg),
        }
        Ok(())
    }

    fn handle_publish(&mut self, conn: ConnectionId, msg: &Message) {
        match self.deliver(msg) {
            Ok(_) => {
                if self.connection(&conn).is_some_and(|c| c.confirm_required) {
                    let confirm = Action::new(ActionType::Confirm).with_id(msg.confirm_id());
                    self.send_to(conn, confirm.into_message().to_bytes());
                }
            }
            Err(e) => self.queue_error(conn, msg.destination(), &e.to_string()),
        }
    }

    fn handle_action(&mut self, conn: ConnectionId, payload: &Bytes) {
        let action = match Action::decode(payload.clone()) {
            Ok(action) => action,
            Err(e) => {
                warn!("Unparseable action from {conn}: {e}");
                self.queue_error(conn, "", "unparseable action");
                return;
            }
        };
        let kind = match action.kind() {
            Ok(kind) => kind,
            Err(raw) => {
                warn!("Unknown action type {raw} from {conn}");
                self.queue_error(conn, "", &format!("unknown action type {raw}"));
                return;
            }
        };
        debug!("{conn} sent {kind:?}");

        match kind {
            ActionType::Subscribe => {
                let Some(name) = self.action_target(conn, &action) else {
                    return;
                };
                if let Err(e) = self.subscribe(conn, &name) {
                    self.queue_error(conn, &name, &e.to_string());
                }
            }
            ActionType::Flush => {
                let Some(name) = self.action_target(conn, &action) else {
                    return;
                };
                if name.is_empty() {
                    self.flush_subscriptions(conn);
                } else if let Err(e) = self.flush(conn, &name) {
                    self.queue_error(conn, &name, &e.to_string());
                }
            }
            ActionType::Configure => {
                let body = action.payload.clone().unwrap_or_default();
                match ConnectionConfigure::decode(body) {
                    Ok(cfg) => {
                        self.configure(conn, &cfg);
                        // a larger window or acks turned off may free capacity
                        self.flush_subscriptions(conn);
                    }
                    Err(e) => {
                        warn!("Bad configure from {conn}: {e}");
                        self.queue_error(conn, "", "unparseable configure");
                    }
                }
            }
            ActionType::RequestAck => self.configure(
                conn,
                &ConnectionConfigure {
                    ack: Some(true),
                    ..Default::default()
                },
            ),
            ActionType::RequestConfirm => self.configure(
                conn,
                &ConnectionConfigure {
                    confirm: Some(true),
                    ..Default::default()
                },
            ),
            ActionType::Ack => match action.id {
                Some(id) => self.ack(conn, id),
                None => warn!("{conn} sent an ack without an id"),
            },
            ActionType::Confirm => warn!("{conn} sent a confirm; only the server sends those"),
            ActionType::QueueError => warn!("{conn} sent a queue error; only the server sends those"),
            ActionType::RequestStat => {
                let Some(name) = self.action_target(conn, &action) else {
                    return;
                };
                let stat = self.stat(&name);
                self.send_to(conn, WireMessage::new(STAT_DEST, stat.encode_to_vec()).to_bytes());
            }
            ActionType::MakeBroadcastQueue => self.declare(conn, &action, QueueKind::Broadcast),
            ActionType::MakeTransientQueue => self.declare(conn, &action, QueueKind::Transient),
            ActionType::MakeDurableQueue => self.declare(conn, &action, QueueKind::Durable),
            ActionType::MakeEphemeralQueue => self.declare(conn, &action, QueueKind::Ephemeral),
            ActionType::Bond => {
                let body = action.payload.clone().unwrap_or_default();
                match BondRequest::decode(body) {
                    Ok(req) => {
                        if let Err(e) = self.bond(&req.queue, &req.destination) {
                            self.queue_error(conn, &req.queue, &e.to_string());
                        }
                    }
                    Err(e) => {
                        warn!("Bad bond request from {conn}: {e}");
                        self.queue_error(conn, "", "unparseable bond request");
                    }
                }
            }
        }
    }

    fn declare(&mut self, conn: ConnectionId, action: &Action, kind: QueueKind) {
        let Some(name) = self.action_target(conn, action) else {
            return;
        };
        if let Err(e) = self.make_queue(&name, kind, Some(conn)) {
            warn!("Unable to declare {kind} queue '{name}': {e}");
            self.queue_error(conn, &name, &e.to_string());
        }
    }

    /// Queue name carried by `action`, or `None` after telling the client it
    /// is not valid UTF-8.
    fn action_target(&self, conn: ConnectionId, action: &Action) -> Option<String> {
        match action.payload_str() {
            Some(name) => Some(name.to_string()),
            None => {
                self.queue_error(conn, "", "queue name is not valid UTF-8");
                None
            }
        }
    }

    fn handle_replica(&mut self, conn: ConnectionId, payload: &Bytes) {
        let action = match ReplicaAction::decode(payload.clone()) {
            Ok(action) => action,
            Err(e) => {
                warn!("Unparseable replica action from {conn}: {e}");
                return;
            }
        };
        match ReplicaActionType::try_from(action.r#type) {
            Ok(ReplicaActionType::Start) => self.start_replica(conn),
            Ok(ReplicaActionType::Reserve) => {
                let name = action
                    .payload
                    .as_deref()
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .unwrap_or_default()
                    .to_string();
                let result = if self.queue(&name).is_some() {
                    self.reserve(&name).map(|_| ())
                } else {
                    self.make_queue(&name, QueueKind::Durable, None)
                };
                if let Err(e) = result {
                    warn!("Unable to reserve mirrored queue '{name}': {e}");
                }
            }
            Err(_) => warn!("Unknown replica action {} from {conn}", action.r#type),
        }
    }

    /// Report a routing or protocol problem to `conn` on the control channel.
    pub fn queue_error(&self, conn: ConnectionId, queue: &str, error: &str) {
        let body = QueueError {
            queue: queue.to_string(),
            error: error.to_string(),
        };
        let action = Action::new(ActionType::QueueError).with_payload(body.encode_to_vec());
        if !self.send_to(conn, action.into_message().to_bytes()) {
            debug!("Could not report '{error}' to {conn}");
        }
    }
}
