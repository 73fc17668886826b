//! Server configuration
//!
//! Loaded from a TOML file with a `[server]` table and any number of
//! `[[applications]]` entries. Every field has a default, so an empty file
//! (or no file) gives a usable server with no configured applications.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cameo_core::prelude::*;
use cameo_core::Endpoint;

use crate::allocator::MAX_ID;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_BASE_PORT: u16 = 7010;
pub const DEFAULT_POLLING_TIME: Duration = Duration::from_millis(100);
pub const DEFAULT_STOPPING_TIME: Duration = Duration::from_secs(3);

/// Complete server configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    /// Request endpoint port; the event stream is published on `port + 1`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// First port handed out to instances.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Maximum number of live instances.
    #[serde(default = "default_max_applications")]
    pub max_applications: i32,

    #[serde(default = "default_polling_time_ms")]
    pub polling_time_ms: u64,

    /// Default request timeout for clients, 0 for none.
    #[serde(default)]
    pub request_timeout_ms: u64,

    /// Stop grace period for applications that do not set their own.
    #[serde(default = "default_stopping_time_ms")]
    pub stopping_time_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_port: default_base_port(),
            max_applications: default_max_applications(),
            polling_time_ms: default_polling_time_ms(),
            request_timeout_ms: 0,
            stopping_time_ms: default_stopping_time_ms(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_max_applications() -> i32 {
    MAX_ID
}

fn default_polling_time_ms() -> u64 {
    DEFAULT_POLLING_TIME.as_millis() as u64
}

fn default_stopping_time_ms() -> u64 {
    DEFAULT_STOPPING_TIME.as_millis() as u64
}

impl ServerSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn event_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port.saturating_add(1))
    }

    pub fn polling_time(&self) -> Duration {
        Duration::from_millis(self.polling_time_ms.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// How long an instance stays in STARTING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingTime {
    /// RUNNING after this long, or earlier if the instance reports it.
    After(Duration),
    /// RUNNING only when the instance reports it.
    Reported,
}

/// A launchable application
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Milliseconds in STARTING; -1 waits for the instance to report RUNNING.
    #[serde(default)]
    pub starting_time_ms: i64,

    /// Stop grace period; falls back to the server default.
    #[serde(default)]
    pub stopping_time_ms: Option<u64>,

    /// Live instances allowed for this name; -1 for unlimited.
    #[serde(default = "default_max_instances")]
    pub max_instances: i32,

    /// Start a new instance after a FAILURE.
    #[serde(default)]
    pub restart: bool,

    /// Command run while the instance is in PROCESSING_FAILURE.
    #[serde(default)]
    pub error_command: Option<String>,
}

fn default_max_instances() -> i32 {
    -1
}

impl ApplicationConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            env: HashMap::new(),
            starting_time_ms: 0,
            stopping_time_ms: None,
            max_instances: default_max_instances(),
            restart: false,
            error_command: None,
        }
    }

    pub fn starting_time(&self) -> StartingTime {
        if self.starting_time_ms < 0 {
            StartingTime::Reported
        } else {
            StartingTime::After(Duration::from_millis(self.starting_time_ms as u64))
        }
    }

    pub fn stopping_time(&self, settings: &ServerSettings) -> Duration {
        Duration::from_millis(self.stopping_time_ms.unwrap_or(settings.stopping_time_ms))
    }

    pub fn is_single(&self) -> bool {
        self.max_instances == 1
    }

    /// Whether another instance may start while `running` are alive.
    pub fn allows_another(&self, running: usize) -> bool {
        self.max_instances < 0 || running < self.max_instances as usize
    }
}

impl ServerConfig {
    pub fn find(&self, name: &str) -> Option<&ApplicationConfig> {
        self.applications.iter().find(|a| a.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for app in &self.applications {
            if app.name.trim().is_empty() {
                return Err(Error::config("application with empty name"));
            }
            if app.command.trim().is_empty() {
                return Err(Error::config(format!(
                    "application '{}' has no command",
                    app.name
                )));
            }
            if app.max_instances == 0 || app.max_instances < -1 {
                return Err(Error::config(format!(
                    "application '{}': max_instances must be -1 or positive",
                    app.name
                )));
            }
            if !seen.insert(app.name.as_str()) {
                return Err(Error::config(format!(
                    "application '{}' is defined twice",
                    app.name
                )));
            }
        }
        if self.server.max_applications <= 0 {
            return Err(Error::config("max_applications must be positive"));
        }
        Ok(())
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
    let config: ServerConfig = toml::from_str(&content)
        .map_err(|e| Error::config(format!("Failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    debug!(
        "Loaded {} application(s) from {:?}",
        config.applications.len(),
        path
    );
    Ok(config)
}

/// Load a configuration file, falling back to defaults.
pub fn load_config_or_default(path: &Path) -> ServerConfig {
    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return ServerConfig::default();
    }

    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}", e);
            ServerConfig::default()
        }
    }
}
