use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the listener, broker behavior, storage location, replication peers
/// and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub replication: ReplicationSettings,
    pub log: LogSettings,
}

/// Where the broker listens and how many sockets it serves at once.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Create unknown queues as Transient instead of answering "no such queue".
    pub implicit_queues: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub path: String,
}

/// Masters this instance follows as a replica. Empty for a standalone broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct ReplicationSettings {
    pub masters: Vec<PeerSettings>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PeerSettings {
    pub host: String,
    pub port: u16,
}

impl PeerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub replication: Option<PartialReplicationSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub implicit_queues: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialReplicationSettings {
    pub masters: Option<Vec<PeerSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 7621,
                max_connections: 1024,
            },
            broker: BrokerSettings {
                implicit_queues: false,
            },
            storage: StorageSettings {
                path: "harq.db".to_string(),
            },
            replication: ReplicationSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `Settings::default()`.
    pub fn merge(self) -> Settings {
        let default = Settings::default();
        Settings {
            server: ServerSettings {
                host: self
                    .server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: self
                    .server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                max_connections: self
                    .server
                    .as_ref()
                    .and_then(|s| s.max_connections)
                    .unwrap_or(default.server.max_connections),
            },
            broker: BrokerSettings {
                implicit_queues: self
                    .broker
                    .as_ref()
                    .and_then(|b| b.implicit_queues)
                    .unwrap_or(default.broker.implicit_queues),
            },
            storage: StorageSettings {
                path: self
                    .storage
                    .and_then(|s| s.path)
                    .unwrap_or(default.storage.path),
            },
            replication: ReplicationSettings {
                masters: self
                    .replication
                    .and_then(|r| r.masters)
                    .unwrap_or(default.replication.masters),
            },
            log: LogSettings {
                level: self
                    .log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}
