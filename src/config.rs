//! Configuration for the I/O engine.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Library callers
//! that never touch the CLI start from `Config::default()`.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the engine binary
#[derive(Parser, Debug)]
#[command(name = "nbio")]
#[command(author = "nbio authors")]
#[command(version = "0.1.0")]
#[command(about = "A non-blocking line-echo server built on the nbio engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of dispatcher threads (defaults to number of CPU cores)
    #[arg(short = 'd', long)]
    pub dispatchers: Option<usize>,

    /// Connection idle timeout in milliseconds (0 = never)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of dispatcher threads
    pub dispatchers: Option<usize>,
    /// Grace period for dispatcher shutdown in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// PEM certificate chain for TLS listeners
    pub tls_cert: Option<PathBuf>,
    /// PEM private key matching `tls_cert`
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            dispatchers: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    /// Idle timeout in milliseconds (0 = never)
    #[serde(default)]
    pub idle_timeout_ms: u64,
    /// Connection lifetime timeout in milliseconds (0 = never)
    #[serde(default)]
    pub lifetime_timeout_ms: u64,
    /// Upper bound for draining pending writes on graceful close
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Size of each preallocated receive buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Reallocate once the unused part of the receive buffer drops below this
    #[serde(default = "default_read_buffer_min_size")]
    pub read_buffer_min_size: usize,
    /// Preallocate receive buffers (false = allocate an exact-size chunk per read)
    #[serde(default = "default_true")]
    pub read_buffer_preallocate: bool,
    /// Upper bound on one multiplexer wait in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Interval between timeout sweeps in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 0,
            lifetime_timeout_ms: 0,
            close_timeout_ms: default_close_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
            read_buffer_min_size: default_read_buffer_min_size(),
            read_buffer_preallocate: true,
            poll_timeout_ms: default_poll_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    /// Maximum time a connection may sit idle in the pool (0 = unlimited)
    #[serde(default)]
    pub max_idle_time_ms: u64,
    /// Maximum total lifetime of a pooled connection (0 = unlimited)
    #[serde(default)]
    pub max_lifetime_ms: u64,
    /// Maximum active connections over all endpoints (0 = unlimited)
    #[serde(default)]
    pub max_active: usize,
    /// Maximum active connections per endpoint (0 = unlimited)
    #[serde(default)]
    pub max_active_per_endpoint: usize,
    /// Maximum idle connections kept (0 = unlimited)
    #[serde(default)]
    pub max_idle: usize,
    /// How long `acquire` waits for a release when limits are reached
    #[serde(default)]
    pub max_wait_ms: u64,
    /// Timeout for establishing a new connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Period of the idle-connection watchdog
    #[serde(default = "default_pool_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_idle_time_ms: 0,
            max_lifetime_ms: 0,
            max_active: 0,
            max_active_per_endpoint: 0,
            max_idle: 0,
            max_wait_ms: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            sweep_interval_ms: default_pool_sweep_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_close_timeout_ms() -> u64 {
    3_000
}

fn default_read_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_read_buffer_min_size() -> usize {
    4 * 1024
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_pool_sweep_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `0` means "no limit" in the file format.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn limit(n: usize) -> Option<usize> {
    (n > 0).then_some(n)
}

/// Receive buffer allocation settings
#[derive(Debug, Clone)]
pub struct ReadBufferConfig {
    pub size: usize,
    pub min_size: usize,
    pub preallocate: bool,
}

impl Default for ReadBufferConfig {
    fn default() -> Self {
        Self {
            size: default_read_buffer_size(),
            min_size: default_read_buffer_min_size(),
            preallocate: true,
        }
    }
}

/// Settings shared by every dispatcher and the connections it owns
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub idle_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub close_timeout: Duration,
    pub read_buffer: ReadBufferConfig,
    pub poll_timeout: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&ConnectionSection::default()).with_grace(default_shutdown_grace_ms())
    }
}

impl From<&ConnectionSection> for DispatcherConfig {
    fn from(section: &ConnectionSection) -> Self {
        Self {
            idle_timeout: millis(section.idle_timeout_ms),
            connection_timeout: millis(section.lifetime_timeout_ms),
            close_timeout: Duration::from_millis(section.close_timeout_ms),
            read_buffer: ReadBufferConfig {
                size: section.read_buffer_size,
                min_size: section.read_buffer_min_size.min(section.read_buffer_size).max(1),
                preallocate: section.read_buffer_preallocate,
            },
            poll_timeout: Duration::from_millis(section.poll_timeout_ms.max(1)),
            sweep_interval: Duration::from_millis(section.sweep_interval_ms.max(1)),
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
        }
    }
}

impl DispatcherConfig {
    fn with_grace(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace = Duration::from_millis(grace_ms);
        self
    }
}

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_time: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub max_active: Option<usize>,
    pub max_active_per_endpoint: Option<usize>,
    pub max_idle: Option<usize>,
    pub max_wait: Duration,
    pub connect_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSection::default())
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            max_idle_time: millis(section.max_idle_time_ms),
            max_lifetime: millis(section.max_lifetime_ms),
            max_active: limit(section.max_active),
            max_active_per_endpoint: limit(section.max_active_per_endpoint),
            max_idle: limit(section.max_idle),
            max_wait: Duration::from_millis(section.max_wait_ms),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms.max(1)),
            sweep_interval: Duration::from_millis(section.sweep_interval_ms.max(1)),
        }
    }
}

/// Certificate and key for a TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// Serve TLS when set.
    pub tls: Option<TlsFiles>,
    /// Number of dispatchers; `None` means one per CPU core.
    pub dispatchers: Option<usize>,
    pub dispatcher: DispatcherConfig,
    pub pool: PoolConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Resolve a parsed TOML file without any CLI overrides.
    pub fn from_toml(toml_config: TomlConfig) -> Self {
        let dispatcher = DispatcherConfig::from(&toml_config.connection)
            .with_grace(toml_config.server.shutdown_grace_ms);

        let tls = match (toml_config.server.tls_cert, toml_config.server.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            _ => None,
        };

        Config {
            listen: toml_config.server.listen,
            tls,
            dispatchers: toml_config.server.dispatchers,
            dispatcher,
            pool: PoolConfig::from(&toml_config.pool),
            log_level: toml_config.logging.level,
        }
    }

    fn merge(cli: CliArgs, mut toml_config: TomlConfig) -> Self {
        if let Some(idle) = cli.idle_timeout_ms {
            toml_config.connection.idle_timeout_ms = idle;
        }
        if cli.tls_cert.is_some() {
            toml_config.server.tls_cert = cli.tls_cert;
        }
        if cli.tls_key.is_some() {
            toml_config.server.tls_key = cli.tls_key;
        }
        let cli_level = cli.log_level;
        let mut config = Self::from_toml(toml_config);

        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        config.dispatchers = cli.dispatchers.or(config.dispatchers);
        if cli_level != "info" {
            config.log_level = cli_level;
        }
        config
    }

    /// Effective dispatcher count.
    pub fn dispatcher_count(&self) -> usize {
        match self.dispatchers {
            Some(n) if n > 0 => n,
            _ => num_cpus(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:7878");
        assert_eq!(config.dispatcher.idle_timeout, None);
        assert_eq!(config.dispatcher.read_buffer.size, 64 * 1024);
        assert_eq!(config.dispatcher.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.pool.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.pool.max_active, None);
        assert!(config.dispatcher_count() >= 1);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            dispatchers = 4
            shutdown_grace_ms = 1000

            [connection]
            idle_timeout_ms = 60000
            read_buffer_size = 8192
            read_buffer_min_size = 512
            read_buffer_preallocate = false

            [pool]
            max_idle_time_ms = 30000
            max_lifetime_ms = 600000
            max_active = 16
            max_wait_ms = 250

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.server.dispatchers, Some(4));

        let config = Config::from_toml(parsed);
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.dispatcher_count(), 4);
        assert_eq!(config.dispatcher.shutdown_grace, Duration::from_secs(1));
        assert_eq!(config.dispatcher.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.dispatcher.connection_timeout, None);
        assert_eq!(config.dispatcher.read_buffer.min_size, 512);
        assert!(!config.dispatcher.read_buffer.preallocate);
        assert_eq!(config.pool.max_idle_time, Some(Duration::from_secs(30)));
        assert_eq!(config.pool.max_lifetime, Some(Duration::from_secs(600)));
        assert_eq!(config.pool.max_active, Some(16));
        assert_eq!(config.pool.max_idle, None);
        assert_eq!(config.pool.max_wait, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_min_size_clamped_to_buffer_size() {
        let section = ConnectionSection {
            read_buffer_size: 1024,
            read_buffer_min_size: 4096,
            ..ConnectionSection::default()
        };
        let config = DispatcherConfig::from(&section);
        assert_eq!(config.read_buffer.min_size, 1024);
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let only_cert: TomlConfig = toml::from_str(
            r#"
            [server]
            tls_cert = "server.pem"
            "#,
        )
        .unwrap();
        assert_eq!(Config::from_toml(only_cert).tls, None);

        let both: TomlConfig = toml::from_str(
            r#"
            [server]
            tls_cert = "server.pem"
            tls_key = "server.key"
            "#,
        )
        .unwrap();
        assert_eq!(
            Config::from_toml(both).tls,
            Some(TlsFiles {
                cert: PathBuf::from("server.pem"),
                key: PathBuf::from("server.key"),
            })
        );
    }
}
