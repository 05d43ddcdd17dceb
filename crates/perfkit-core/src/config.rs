//! Configuration types for the perfkit client.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Upper bound for the trace fetch interval, in milliseconds.
pub const MAX_FETCH_INTERVAL_MS: u64 = 1000;

/// Client configuration loaded from YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Shell output buffer settings
    pub shell: ShellSettings,
    /// Trace polling settings
    pub trace: TraceSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl ClientConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ClientConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(Error::Config("connection.host cannot be empty".to_string()));
        }

        if self.connection.max_sessions == 0 {
            return Err(Error::Config(
                "connection.max_sessions must be > 0".to_string(),
            ));
        }

        if self.shell.low_water_bytes >= self.shell.high_water_bytes {
            return Err(Error::Config(format!(
                "shell.low_water_bytes ({}) must be below shell.high_water_bytes ({})",
                self.shell.low_water_bytes, self.shell.high_water_bytes
            )));
        }

        if self.trace.fetch_interval_ms > MAX_FETCH_INTERVAL_MS {
            return Err(Error::Config(format!(
                "trace.fetch_interval_ms must be <= {MAX_FETCH_INTERVAL_MS}"
            )));
        }

        if self.trace.history_capacity == 0 {
            return Err(Error::Config(
                "trace.history_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Maximum number of concurrent session slots
    pub max_sessions: usize,
}

impl ConnectionSettings {
    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25572,
            max_sessions: 8,
        }
    }
}

/// Shell output buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSettings {
    /// Buffer length that triggers a head trim
    pub high_water_bytes: usize,
    /// Buffer length retained after a trim
    pub low_water_bytes: usize,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            high_water_bytes: 2 << 20,
            low_water_bytes: 1 << 20,
        }
    }
}

/// Trace polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Interval between fetches of one class (0-1000 ms)
    pub fetch_interval_ms: u64,
    /// Age after which an unresolved fetch is considered stalled
    pub fetch_timeout_ms: u64,
    /// Samples kept per plotted node
    pub history_capacity: usize,
    /// Start fetching newly advertised classes without an explicit toggle
    pub auto_trace: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            fetch_interval_ms: 100,
            fetch_timeout_ms: 3000,
            history_capacity: 1024,
            auto_trace: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
