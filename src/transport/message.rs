//! Wire records exchanged with clients and replicas.
//!
//! Every frame on a socket is a 4-byte big-endian length followed by an
//! encoded [`WireMessage`]. Messages addressed to [`CONTROL_DEST`] carry an
//! encoded [`Action`] as payload; messages addressed to [`REPLICA_DEST`] carry
//! a [`ReplicaAction`]. Field tags are fixed and must not be renumbered.

use bytes::Bytes;
use prost::Message as _;

/// Destination of control-plane actions.
pub const CONTROL_DEST: &str = "+";
/// Destination of replica-feed actions.
pub const REPLICA_DEST: &str = "+replica";
/// Destination of stat replies.
pub const STAT_DEST: &str = "+stat";

/// Flag bit: keep a transient publish even when nobody is subscribed.
pub const FLAG_PERSIST: u32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessage {
    #[prost(string, required, tag = "1")]
    pub destination: String,
    #[prost(bytes = "bytes", required, tag = "2")]
    pub payload: Bytes,
    #[prost(uint64, optional, tag = "3")]
    pub id: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub flags: Option<u32>,
    #[prost(uint64, optional, tag = "5")]
    pub confirm_id: Option<u64>,
}

impl WireMessage {
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            id: None,
            flags: None,
            confirm_id: None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ActionType {
    Subscribe = 1,
    Configure = 2,
    Flush = 4,
    /// Older clients enable acks with a bare action instead of `Configure`.
    RequestAck = 5,
    Ack = 6,
    /// Older clients enable confirms with a bare action instead of `Configure`.
    RequestConfirm = 7,
    Confirm = 8,
    RequestStat = 9,
    MakeBroadcastQueue = 10,
    MakeTransientQueue = 11,
    MakeDurableQueue = 12,
    QueueError = 13,
    Bond = 14,
    MakeEphemeralQueue = 15,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Action {
    #[prost(int32, required, tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub payload: Option<Bytes>,
    #[prost(uint64, optional, tag = "3")]
    pub id: Option<u64>,
}

impl Action {
    pub fn new(kind: ActionType) -> Self {
        Self {
            r#type: kind as i32,
            payload: None,
            id: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The decoded action type, or the raw value when it is not one we know.
    pub fn kind(&self) -> Result<ActionType, i32> {
        ActionType::try_from(self.r#type).map_err(|_| self.r#type)
    }

    /// The payload interpreted as a queue name. Absent payloads read as "".
    pub fn payload_str(&self) -> Option<&str> {
        match &self.payload {
            Some(bytes) => std::str::from_utf8(bytes).ok(),
            None => Some(""),
        }
    }

    /// Wrap this action in a frame addressed to the control destination.
    pub fn into_message(self) -> WireMessage {
        WireMessage::new(CONTROL_DEST, self.encode_to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReplicaActionType {
    Start = 1,
    Reserve = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplicaAction {
    #[prost(int32, required, tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub payload: Option<Bytes>,
}

impl ReplicaAction {
    pub fn start() -> Self {
        Self {
            r#type: ReplicaActionType::Start as i32,
            payload: None,
        }
    }

    pub fn reserve(name: &str) -> Self {
        Self {
            r#type: ReplicaActionType::Reserve as i32,
            payload: Some(Bytes::copy_from_slice(name.as_bytes())),
        }
    }

    pub fn into_message(self) -> WireMessage {
        WireMessage::new(REPLICA_DEST, self.encode_to_vec())
    }
}

/// Payload of `Configure`. Absent fields leave the current setting alone.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionConfigure {
    #[prost(bool, optional, tag = "1")]
    pub tap: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub ack: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub confirm: Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub inflight: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueError {
    #[prost(string, required, tag = "1")]
    pub queue: String,
    #[prost(string, required, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BondRequest {
    #[prost(string, required, tag = "1")]
    pub queue: String,
    #[prost(string, required, tag = "2")]
    pub destination: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Stat {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(bool, required, tag = "2")]
    pub exists: bool,
    #[prost(uint32, optional, tag = "3")]
    pub transient_size: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub durable_size: Option<u32>,
}
