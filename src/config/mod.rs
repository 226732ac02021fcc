use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::websocket::{SessionConfig, UpgradeConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address. A bare `:port` binds every interface.
    pub addr: String,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpgradeSettings {
    pub path: String,
    pub subprotocols: Vec<String>,
    pub allow_all_origins: bool,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub max_message_size: usize,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub upgrade: UpgradeSettings,
    pub session: SessionSettings,
}

fn with_defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("environment", environment)?
        .set_default("server.addr", ":8080")?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("upgrade.path", "/ws")?
        .set_default("upgrade.subprotocols", vec!["testticket"])?
        .set_default("upgrade.allow_all_origins", true)?
        .set_default("upgrade.read_buffer_size", 1024)?
        .set_default("upgrade.write_buffer_size", 1024)?
        .set_default("upgrade.handshake_timeout_secs", 10)?
        .set_default("session.queue_capacity", 256)?
        .set_default("session.max_message_size", 100_000)?
        .set_default("session.pong_wait_secs", 60)?
        .set_default("session.write_wait_secs", 10)
}

// E.g., `APP_SERVER__ADDR=127.0.0.1:9000` would set `Settings.server.addr`
fn environment_source() -> Environment {
    Environment::with_prefix("app")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("upgrade.subprotocols")
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = with_defaults(&run_mode)?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(environment_source())
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        let settings: Settings = with_defaults("test")?
            .add_source(environment_source())
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values that would make a session unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("server.workers", self.server.workers as u64),
            ("session.queue_capacity", self.session.queue_capacity as u64),
            ("session.max_message_size", self.session.max_message_size as u64),
            ("session.pong_wait_secs", self.session.pong_wait_secs),
            ("session.write_wait_secs", self.session.write_wait_secs),
            ("upgrade.read_buffer_size", self.upgrade.read_buffer_size as u64),
            ("upgrade.write_buffer_size", self.upgrade.write_buffer_size as u64),
            ("upgrade.handshake_timeout_secs", self.upgrade.handshake_timeout_secs),
        ];
        if let Some((key, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Message(format!("{} must be greater than zero", key)));
        }
        if !self.upgrade.path.starts_with('/') {
            return Err(ConfigError::Message(format!(
                "upgrade.path must start with '/', got {:?}",
                self.upgrade.path
            )));
        }
        Ok(())
    }

    /// Resolves `server.addr` into something `TcpListener::bind` accepts.
    pub fn listen_addr(&self) -> String {
        if self.server.addr.starts_with(':') {
            format!("0.0.0.0{}", self.server.addr)
        } else {
            self.server.addr.clone()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.session.queue_capacity,
            max_message_size: self.session.max_message_size,
            pong_wait: Duration::from_secs(self.session.pong_wait_secs),
            write_wait: Duration::from_secs(self.session.write_wait_secs),
        }
    }

    pub fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig {
            path: self.upgrade.path.clone(),
            subprotocols: self.upgrade.subprotocols.clone(),
            allow_all_origins: self.upgrade.allow_all_origins,
            read_buffer_size: self.upgrade.read_buffer_size,
            write_buffer_size: self.upgrade.write_buffer_size,
            max_message_size: self.session.max_message_size,
            handshake_timeout: Duration::from_secs(self.upgrade.handshake_timeout_secs),
        }
    }
}
