mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, LogSettings, PeerSettings, ReplicationSettings, ServerSettings, Settings, StorageSettings,
};

/// Loads the configuration from `config/default` and environment variables
/// and merges it over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like [`load_config`], with the configuration file at `base` (any extension
/// the `config` crate understands, e.g. `base.toml`). A missing file is fine.
///
/// Environment variables use the `HARQ_` prefix and `__` between sections,
/// e.g. `HARQ_SERVER__PORT=7700` or `HARQ_BROKER__IMPLICIT_QUEUES=true`.
pub fn load_config_from(base: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(base).required(false))
        .add_source(
            Environment::with_prefix("HARQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge())
}
