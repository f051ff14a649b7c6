//! The `transport` module is responsible for network communication with
//! clients and with other brokers.
//!
//! It defines the wire records ([`message`]), runs the length-prefixed TCP
//! server that feeds frames to the broker ([`tcp`]) and the replica link that
//! follows a master broker ([`replica`]).

pub mod message;
pub mod replica;
pub mod tcp;
