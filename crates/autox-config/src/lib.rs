//! Configuration for the autox debug server and its logging.
//!
//! Configuration is read from TOML:
//!
//! ```toml
//! [debug]
//! enabled = true
//! port = 9876
//! wire_format = "json"
//!
//! [logging]
//! level = "autox.debug=debug,info"
//! ```
//!
//! Every key is optional; missing keys take the defaults documented on each field.

use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

pub use autox_debug_proto::WireFormat;

/// Environment variable overriding [`DebugServerConfig::port`].
pub const PORT_ENV_VAR: &str = "AUTOX_DEBUG_PORT";

/// Port the server listens on and the bundled client connects to by default.
pub const DEFAULT_PORT: u16 = 9876;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoxConfig {
    #[serde(default)]
    pub debug: DebugServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugServerConfig {
    /// Start the debug server at all. When disabled, breakpoint checks are never wired in.
    #[serde(default)]
    pub enabled: bool,

    /// Interface to listen on. Accepts an IP address or `localhost`.
    #[serde(default = "DebugServerConfig::default_host")]
    pub host: String,

    #[serde(default = "DebugServerConfig::default_port")]
    pub port: u16,

    #[serde(default)]
    pub wire_format: WireFormat,

    /// Pause before retrying after a failed read on the debug connection.
    #[serde(default = "DebugServerConfig::default_read_retry_backoff_ms")]
    pub read_retry_backoff_ms: u64,

    /// How often `start` re-checks the handshake latch and the reader's health.
    #[serde(default = "DebugServerConfig::default_handshake_poll_interval_ms")]
    pub handshake_poll_interval_ms: u64,

    #[serde(default = "DebugServerConfig::default_client_connect_timeout_ms")]
    pub client_connect_timeout_ms: u64,

    #[serde(default = "DebugServerConfig::default_client_connect_retry_ms")]
    pub client_connect_retry_ms: u64,
}

impl DebugServerConfig {
    fn default_host() -> String {
        "127.0.0.1".to_owned()
    }

    fn default_port() -> u16 {
        DEFAULT_PORT
    }

    fn default_read_retry_backoff_ms() -> u64 {
        1000
    }

    fn default_handshake_poll_interval_ms() -> u64 {
        100
    }

    fn default_client_connect_timeout_ms() -> u64 {
        60_000
    }

    fn default_client_connect_retry_ms() -> u64 {
        500
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }

    pub fn handshake_poll_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_interval_ms.max(1))
    }

    pub fn client_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.client_connect_timeout_ms)
    }

    pub fn client_connect_retry(&self) -> Duration {
        Duration::from_millis(self.client_connect_retry_ms.max(1))
    }

    /// Address the server binds to.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim();
        let ip = if host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            host.parse::<IpAddr>().map_err(|_| ConfigError::Invalid {
                field: "debug.host",
                message: format!("{host:?} is not an IP address"),
            })?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for DebugServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: Self::default_host(),
            port: Self::default_port(),
            wire_format: WireFormat::default(),
            read_retry_backoff_ms: Self::default_read_retry_backoff_ms(),
            handshake_poll_interval_ms: Self::default_handshake_poll_interval_ms(),
            client_connect_timeout_ms: Self::default_client_connect_timeout_ms(),
            client_connect_retry_ms: Self::default_client_connect_retry_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file as well. An unopenable file disables only this sink.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Effective filter: the configured level merged with `RUST_LOG` when that is set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Toml(sanitize_toml_error_message(value.message()))
    }
}

fn sanitize_toml_error_message(message: &str) -> String {
    // `invalid type: string "secret", expected a boolean`: config strings may hold credentials.
    let mut out = String::with_capacity(message.len());
    let mut in_quote = false;
    let mut escaped = false;
    for ch in message.chars() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
                out.push_str("<redacted>\"");
            }
            continue;
        }
        out.push(ch);
        if ch == '"' {
            in_quote = true;
        }
    }
    if in_quote {
        out.push_str("<redacted>");
    }
    out
}

impl AutoxConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `AUTOX_DEBUG_PORT` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(PORT_ENV_VAR) {
            let raw = raw.trim();
            if !raw.is_empty() {
                self.debug.port = raw.parse::<u16>().map_err(|err| ConfigError::Invalid {
                    field: "debug.port",
                    message: format!("{PORT_ENV_VAR}: {err}"),
                })?;
            }
        }
        Ok(())
    }

    /// Semantic checks that TOML deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.debug.enabled {
            return Ok(());
        }
        if self.debug.port == 0 {
            return Err(ConfigError::Invalid {
                field: "debug.port",
                message: "an enabled debug server needs a non-zero port".to_owned(),
            });
        }
        self.debug.socket_addr()?;
        Ok(())
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber. Only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let mut make_writer = if config.stderr {
            // Keep `cargo test` capture working in debug builds.
            if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(std::io::stderr)
            }
        } else {
            BoxMakeWriter::new(std::io::sink)
        };

        let mut file_open_error = None;
        if let Some(path) = config.file.as_ref() {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    make_writer = BoxMakeWriter::new(make_writer.and(Mutex::new(file)));
                }
                Err(err) => file_open_error = Some((path.clone(), err)),
            }
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            if let Some((path, err)) = file_open_error {
                tracing::warn!(
                    target: "autox.config",
                    path = %path.display(),
                    error = %err,
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
