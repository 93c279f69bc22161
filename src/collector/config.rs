use config::Source;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{AgentError, Result};

/// Section holding the keys the runtime itself reads
pub const SECTION_BASE: &str = "base";

/// Interval used when a configuration file does not set one
pub const DEFAULT_INTERVAL_SECS: u64 = 15;

/// Parsed settings of one collector configuration file
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSettings {
    /// Whether the collector should be running
    pub enabled: bool,
    /// Declared collection interval
    pub interval: Duration,
    /// Explicit collector class, overriding the name-derived default
    pub collector_class: Option<String>,
    /// Every key of every section, as strings
    sections: HashMap<String, HashMap<String, String>>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            collector_class: None,
            sections: HashMap::new(),
        }
    }
}

impl CollectorSettings {
    /// Parse an INI-style collector configuration file
    ///
    /// Option names are case-insensitive and a `;` preceded by whitespace
    /// starts an inline comment. Missing `[base]` keys fall back to
    /// `enabled = false` and the default interval.
    pub fn from_file(path: &Path) -> Result<Self> {
        let parse_error = |reason: String| AgentError::ConfigParse {
            path: path.display().to_string(),
            reason,
        };

        let parsed = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()
            .map_err(|e| parse_error(e.to_string()))?;

        let mut sections = HashMap::new();
        for (section, value) in parsed.collect().map_err(|e| parse_error(e.to_string()))? {
            // Keys outside any section have no meaning to collectors
            let Ok(table) = value.into_table() else {
                continue;
            };

            let mut entries = HashMap::new();
            for (key, value) in table {
                let value = value
                    .into_string()
                    .map_err(|e| parse_error(format!("{}.{}: {}", section, key, e)))?;
                entries.insert(key.to_lowercase(), strip_inline_comment(&value).to_string());
            }
            sections.insert(section, entries);
        }

        let base = |key: &str| -> Option<config::Value> {
            sections
                .get(SECTION_BASE)
                .and_then(|entries| entries.get(key))
                .map(|raw| config::Value::new(None, raw.clone()))
        };

        let enabled = match base("enabled") {
            Some(value) => value
                .into_bool()
                .map_err(|e| parse_error(format!("base.enabled: {}", e)))?,
            None => false,
        };

        let interval = match base("interval") {
            Some(value) => value
                .into_int()
                .map_err(|e| parse_error(format!("base.interval: {}", e)))?,
            None => DEFAULT_INTERVAL_SECS as i64,
        };
        let interval = u64::try_from(interval)
            .map_err(|_| parse_error(format!("interval must not be negative, got {}", interval)))?;

        let collector_class = base("collectorclass")
            .and_then(|value| value.into_string().ok())
            .map(|class| class.trim().to_string())
            .filter(|class| !class.is_empty());

        debug!(
            "Parsed {}: enabled={} interval={}s class={:?}",
            path.display(),
            enabled,
            interval,
            collector_class
        );

        Ok(Self {
            enabled,
            interval: Duration::from_secs(interval),
            collector_class,
            sections,
        })
    }

    /// Look up a raw value
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    /// Look up a raw value, falling back to `default`
    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    /// Set a raw value, mainly for building settings in code
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }
}

/// Cut a trailing `; comment` off a value
fn strip_inline_comment(value: &str) -> &str {
    value
        .match_indices(';')
        .map(|(index, _)| index)
        .find(|&index| value[..index].ends_with(char::is_whitespace))
        .map_or(value, |index| value[..index].trim_end())
}

/// One tracked collector configuration file
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// File name within the configuration directory
    pub filename: String,
    /// Absolute path of the file
    pub path: PathBuf,
    /// Parsed settings
    pub settings: CollectorSettings,
    /// Modification time observed when the file was parsed
    pub modified: SystemTime,
}

impl CollectorConfig {
    /// Logical collector name: the filename without its extension
    pub fn name(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.filename)
    }
}
