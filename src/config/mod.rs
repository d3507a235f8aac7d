//! Application configuration.
//!
//! Aggregates the per-component sections into a single Config struct that
//! can be loaded from YAML files or environment variables.

mod sections;

pub use sections::{BridgeConfig, BrokerConfig, ControlConfig, DispatchConfig, WorkerConfig};

use std::path::Path;

use serde::Deserialize;

use crate::dispatch::DispatchRoute;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Legacy variable for the broker URL.
pub const AMQP_URL_ENV_VAR: &str = "AMQP_URL";
/// Legacy variable for the bridge listening port.
pub const SOCKET_PORT_ENV_VAR: &str = "SOCKET_PORT";
/// Legacy variable for the control endpoint port.
pub const MCP_PORT_ENV_VAR: &str = "MCP_PORT";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub bridge: BridgeConfig,
    pub dispatch: DispatchConfig,
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///    (`COURIER__BROKER__URL`)
    /// 5. Legacy variables `AMQP_URL`, `SOCKET_PORT`, `MCP_PORT`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(
                File::from(config_path)
                    .format(FileFormat::Yaml)
                    .required(true),
            );
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_legacy_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Route for dispatched jobs.
    ///
    /// When dispatch targets the worker's queue, the queue is declared with
    /// the worker's options, so either side may declare it first.
    pub fn dispatch_route(&self) -> DispatchRoute {
        match self.dispatch.route() {
            DispatchRoute::Queue(spec) if spec.name == self.worker.queue => {
                DispatchRoute::Queue(self.worker.queue_spec())
            }
            route => route,
        }
    }

    /// Apply the unprefixed legacy variables, read through `lookup`.
    pub fn apply_legacy_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(AMQP_URL_ENV_VAR).filter(|url| !url.is_empty()) {
            self.broker.url = url;
        }
        if let Some(port) = lookup(SOCKET_PORT_ENV_VAR) {
            self.bridge.port = parse_port(SOCKET_PORT_ENV_VAR, port)?;
        }
        if let Some(port) = lookup(MCP_PORT_ENV_VAR) {
            self.control.port = parse_port(MCP_PORT_ENV_VAR, port)?;
        }
        Ok(())
    }
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
