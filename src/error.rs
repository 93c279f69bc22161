// src/error.rs
use std::io;
use thiserror::Error;

// Re-export anyhow's Result type
pub use anyhow::Result;

/// Custom Error type for the metricrelay agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    /// A collector configuration file could not be parsed
    #[error("Failed to parse {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    /// A collector could not be resolved or constructed
    #[error("Failed to load collector {name}: {reason}")]
    PluginLoad { name: String, reason: String },

    /// An active collector failed while being invoked
    #[error("Collector {name} failed: {reason}")]
    Invocation { name: String, reason: String },

    /// A batch could not be delivered to an endpoint
    #[error("Delivery to {endpoint} failed: {reason}")]
    Delivery { endpoint: String, reason: String },

    #[error("Metric error: {0}")]
    Metric(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl AgentError {
    /// Build an invocation error for the named collector
    pub fn invocation(name: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::Invocation {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a plugin load error for the named collector
    pub fn plugin_load(name: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::PluginLoad {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
