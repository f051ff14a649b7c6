//! Replica side of replication: follow a master and mirror what it delivers.
//!
//! The link to a master is an ordinary connection of the local broker whose
//! first frame is `ReplicaAction::Start`. The master then streams every
//! delivered message and every reserve over it, and the local broker handles
//! them like any other publish.

use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::PeerSettings;
use crate::transport::message::ReplicaAction;
use crate::transport::tcp::handle_socket;
use crate::utils::Result;

/// Connect to `master` and mirror it until the link closes.
pub async fn follow(master: &PeerSettings, broker: Arc<Mutex<Broker>>) -> Result<()> {
    let addr = master.addr();
    let stream = TcpStream::connect(&addr).await?;
    info!("Following master {addr}");
    let start = ReplicaAction::start().into_message().to_bytes();
    handle_socket(stream, broker, Some(start)).await;
    warn!("Lost master {addr}");
    Ok(())
}

/// Follow every configured master on its own task.
pub fn spawn_followers(masters: &[PeerSettings], broker: Arc<Mutex<Broker>>) -> Vec<JoinHandle<()>> {
    masters
        .iter()
        .cloned()
        .map(|master| {
            let broker = broker.clone();
            tokio::spawn(async move {
                if let Err(e) = follow(&master, broker).await {
                    warn!("Unable to follow master {}: {e}", master.addr());
                }
            })
        })
        .collect()
}
