//! Agent configuration: layered sources deserialized into [`AgentConfig`]
use log::{debug, warn};
use serde::Deserialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::sender::{Endpoint, Tags};

/// Prefix of environment variables read by [`ConfigBuilder::add_env`]
pub const ENV_PREFIX: &str = "METRICRELAY";

/// Keys whose environment value is a comma separated list
const LIST_KEYS: &[&str] = &["hosts", "tags"];

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (TOML format)
    File(PathBuf),
    /// Environment variables with a prefix
    Environment(String),
    /// TOML string
    Toml(String),
}

/// Load configuration from sources applied in order, later ones overriding
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    continue;
                }

                debug!("Loading TOML configuration from file: {}", path.display());
                builder = builder.add_source(
                    config::File::from(path.as_path()).format(config::FileFormat::Toml),
                );
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(environment(&prefix));
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder
                    .add_source(config::File::from_str(&toml_str, config::FileFormat::Toml));
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build configuration: {}", e)))?;

    let result = config
        .try_deserialize()
        .map_err(|e| AgentError::Config(format!("Failed to deserialize configuration: {}", e)))?;

    debug!("Configuration loaded successfully: {:?}", result);

    Ok(result)
}

fn environment(prefix: &str) -> config::Environment {
    LIST_KEYS.iter().fold(
        config::Environment::with_prefix(prefix)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(","),
        |env, key| env.with_list_parse_key(key),
    )
}

/// Configuration builder
pub struct ConfigBuilder<T: for<'de> Deserialize<'de>> {
    sources: Vec<ConfigSource>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: for<'de> Deserialize<'de> + Debug> Default for ConfigBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: for<'de> Deserialize<'de> + Debug> ConfigBuilder<T> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Add a TOML file source; a missing file is skipped with a warning
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add environment variables, e.g. `METRICRELAY__HTTP__SSL=true`
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add TOML string
    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Toml(toml.into()));
        self
    }

    pub fn build(self) -> Result<T> {
        load_config::<T>(self.sources)
    }
}

/// Agent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Root holding `conf/` and `builtin/`
    #[serde(default = "default_collector_dir")]
    pub collector_dir: PathBuf,
    /// Delivery endpoints as `host[:port]`
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// Global tags as `key=value`
    #[serde(default)]
    pub tags: Vec<String>,
    /// Print batches instead of sending them
    #[serde(default)]
    pub dry_run: bool,
    /// Maximum number of tags per entry
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    /// Length of one scheduler tick in seconds
    #[serde(default = "default_tick_period")]
    pub tick_period_secs: u64,
    /// Upper bound on one collector invocation in seconds, 0 disables
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_secs: u64,
    /// Only invoke a collector once its declared interval has elapsed
    #[serde(default)]
    pub honor_intervals: bool,
    /// Blacklist an endpoint after a failed delivery
    #[serde(default = "default_true")]
    pub blacklist_on_failure: bool,
    /// Retract collectors whose configuration file was deleted
    #[serde(default = "default_true")]
    pub unload_removed: bool,
    #[serde(default)]
    pub http: HttpConfig,
    /// Reserved for value deduplication
    #[serde(default = "default_dedup_interval")]
    pub dedup_interval_secs: u64,
    /// Reserved for value deduplication
    #[serde(default = "default_evict_interval")]
    pub evict_interval_secs: u64,
    /// File receiving the agent's pid
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_collector_dir() -> PathBuf {
    PathBuf::from("collectors")
}

fn default_hosts() -> Vec<String> {
    vec!["localhost:4242".to_string()]
}

fn default_max_tags() -> usize {
    8
}

fn default_tick_period() -> u64 {
    2
}

fn default_invocation_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_dedup_interval() -> u64 {
    300
}

fn default_evict_interval() -> u64 {
    6000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector_dir: default_collector_dir(),
            hosts: default_hosts(),
            tags: Vec::new(),
            dry_run: false,
            max_tags: default_max_tags(),
            tick_period_secs: default_tick_period(),
            invocation_timeout_secs: default_invocation_timeout(),
            honor_intervals: false,
            blacklist_on_failure: true,
            unload_removed: true,
            http: HttpConfig::default(),
            dedup_interval_secs: default_dedup_interval(),
            evict_interval_secs: default_evict_interval(),
            pidfile: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from an optional TOML file overlaid with `METRICRELAY__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::<AgentConfig>::new();
        if let Some(path) = path {
            builder = builder.add_file(path);
        }
        builder.add_env(ENV_PREFIX).build()
    }

    /// Check the invariants the rest of the agent relies on
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { AgentError::Config(msg).into() };

        if self.max_tags == 0 {
            return Err(invalid("max_tags must be positive".to_string()));
        }
        if self.tick_period_secs == 0 {
            return Err(invalid("tick_period_secs must be positive".to_string()));
        }
        if self.evict_interval_secs <= self.dedup_interval_secs {
            return Err(invalid(format!(
                "evict_interval_secs ({}) must be greater than dedup_interval_secs ({})",
                self.evict_interval_secs, self.dedup_interval_secs
            )));
        }

        self.endpoints()?;

        let tags = self.global_tags()?;
        if tags.len() > self.max_tags {
            return Err(invalid(format!(
                "{} global tags exceed max_tags ({})",
                tags.len(),
                self.max_tags
            )));
        }

        Ok(())
    }

    /// Parsed delivery endpoints
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        if self.hosts.is_empty() {
            return Err(AgentError::Config("at least one host is required".to_string()).into());
        }

        let endpoints = self
            .hosts
            .iter()
            .map(|host| host.parse::<Endpoint>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(endpoints)
    }

    /// Configured tags plus `host=<hostname>` unless a host tag is given
    pub fn global_tags(&self) -> Result<Tags> {
        let mut tags = parse_tag_list(&self.tags)?;

        if !tags.contains_key("host") {
            match hostname::get() {
                Ok(name) => {
                    tags.insert("host".to_string(), name.to_string_lossy().into_owned());
                }
                Err(e) => warn!("Could not determine hostname, no host tag added: {}", e),
            }
        }

        Ok(tags)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_period_secs)
    }

    /// Invocation bound, `None` when disabled
    pub fn invocation_timeout(&self) -> Option<Duration> {
        (self.invocation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.invocation_timeout_secs))
    }
}

/// Parse `key=value` tags, rejecting malformed and duplicate keys
pub fn parse_tag_list(raw: &[String]) -> Result<Tags> {
    let mut tags = Tags::new();

    for tag in raw {
        let valid = tag.split_once('=').filter(|(key, value)| {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                && !value.is_empty()
                && !value.chars().any(char::is_whitespace)
        });

        let (key, value) = valid.ok_or_else(|| {
            AgentError::Config(format!("Tag string {:?} must match key=value", tag))
        })?;

        if tags.insert(key.to_string(), value.to_string()).is_some() {
            return Err(AgentError::Config(format!("Duplicate tag key {:?}", key)).into());
        }
    }

    Ok(tags)
}

/// Settings of the HTTP delivery transport
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Use https instead of http
    #[serde(default)]
    pub ssl: bool,
    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Path of the ingestion API
    #[serde(default = "default_http_path")]
    pub path: String,
}

fn default_http_timeout() -> u64 {
    10
}

fn default_http_path() -> String {
    "/api/put?details".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            ssl: false,
            timeout_secs: default_http_timeout(),
            path: default_http_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Log file; stdout when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Size at which the log file is rotated
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Number of rotated files kept
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

fn default_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_backup_count() -> usize {
    1
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            file: None,
            max_bytes: default_max_bytes(),
            backup_count: default_backup_count(),
        }
    }
}

/// Logging level
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}
