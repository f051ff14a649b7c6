//! Records persisted in the store. Encoded with the same protobuf framing as
//! the wire so `fsck` and other tools can read them without the broker.

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct MessageRange {
    #[prost(uint64, required, tag = "1")]
    pub start: u64,
    #[prost(uint64, required, tag = "2")]
    pub count: u64,
}

impl MessageRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    /// One past the last index covered by this range.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }
}

/// Range index of one durable queue.
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueIndex {
    #[prost(uint64, required, tag = "1")]
    pub size: u64,
    #[prost(message, repeated, tag = "2")]
    pub ranges: Vec<MessageRange>,
    /// High-water mark: every index below it has been handed out before.
    #[prost(uint64, optional, tag = "3")]
    pub next: Option<u64>,
}

/// Disk values of a queue kind. Kept separate from the in-memory kind so the
/// two can evolve independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DeclarationType {
    Broadcast = 1,
    Transient = 2,
    Durable = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueDeclaration {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(int32, required, tag = "2")]
    pub r#type: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueConfiguration {
    #[prost(message, repeated, tag = "1")]
    pub queues: Vec<QueueDeclaration>,
}
