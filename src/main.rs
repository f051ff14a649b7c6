//! CLI for harq
//!
//! Subcommands:
//! - `server`: run the broker
//! - `publish`: send one message to a running broker (useful for smoke tests)
//! - `fsck`: check a store for index damage

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use harq::broker::Broker;
use harq::config::{Settings, load_config};
use harq::fsck;
use harq::persistence::Store;
use harq::transport::message::{FLAG_PERSIST, WireMessage};
use harq::transport::{replica, tcp};
use harq::utils::{Result, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "harq", version, about = "Message broker with durable queues")]
enum Command {
    /// Start the broker
    Server {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
        /// Store directory (overrides storage.path)
        #[arg(long)]
        db: Option<String>,
    },
    /// Publish one message
    Publish {
        destination: String,
        payload: String,
        /// Broker to connect to
        #[arg(long, default_value = "127.0.0.1:7621")]
        url: String,
        /// Ask the broker to keep the message even with no subscriber
        #[arg(long)]
        persist: bool,
        #[arg(long)]
        confirm_id: Option<u64>,
    },
    /// Check a store for damaged queue indices
    Fsck {
        /// Store directory (defaults to storage.path)
        path: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Server { host, port, db } => run_server(settings, host, port, db).await,
        Command::Publish {
            destination,
            payload,
            url,
            persist,
            confirm_id,
        } => {
            let mut msg = WireMessage::new(destination, payload);
            if persist {
                msg.flags = Some(FLAG_PERSIST);
            }
            msg.confirm_id = confirm_id;
            tcp::publish_once(&url, msg).await.map(|_| ExitCode::SUCCESS)
        }
        Command::Fsck { path, json } => run_fsck(path.unwrap_or(settings.storage.path), json),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    db: Option<String>,
) -> Result<ExitCode> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    if let Some(db) = db {
        settings.storage.path = db;
    }

    let store = Store::open(&settings.storage.path)?;
    let mut broker = Broker::new(store).with_implicit_queues(settings.broker.implicit_queues);
    broker.load()?;
    let broker = Arc::new(Mutex::new(broker));

    replica::spawn_followers(&settings.replication.masters, broker.clone());

    let addr = settings.server.addr();
    tokio::select! {
        served = tcp::start_server(&addr, broker.clone(), settings.server.max_connections) => {
            served?;
            error!("Server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    tcp::lock(&broker).flush_store()?;
    Ok(ExitCode::SUCCESS)
}

fn run_fsck(path: String, json: bool) -> Result<ExitCode> {
    let store = Store::open(&path)?;
    let report = fsck::check(&store)?;

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => error!("Failed to serialize report: {e}"),
        }
    } else {
        for q in &report.queues {
            println!(
                "{:<24} {:<10} {:>8} messages  ranges {:?}",
                q.name, q.kind, q.size, q.ranges
            );
            for idx in &q.missing {
                println!("  missing message at index {idx}");
            }
            for idx in &q.undecodable {
                println!("  undecodable message at index {idx}");
            }
            for p in &q.problems {
                println!("  {p}");
            }
        }
        println!("{} queues, {} messages", report.queues.len(), report.total_messages());
    }

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
