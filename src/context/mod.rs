use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::collector::{OutputDrain, OutputQueue};
use crate::error::{AgentError, Result};

/// Subdirectory of the collector root holding collector configuration files
pub const CONF_SUBDIR: &str = "conf";

/// Subdirectory of the collector root holding plugin files
pub const BUILTIN_SUBDIR: &str = "builtin";

/// Runtime context shared by the registry and every collector
///
/// Created once at startup and owned by the scheduler. The producer half of
/// the output queue lives here; the scheduler keeps the matching drain.
#[derive(Debug, Clone)]
pub struct AgentContext {
    collector_dir: PathBuf,
    queue: OutputQueue,
}

impl AgentContext {
    /// Resolve the collector root and open the shared output queue.
    ///
    /// A missing or non-directory collector root is fatal.
    pub fn new(collector_dir: impl AsRef<Path>) -> Result<(Self, OutputDrain)> {
        let requested = collector_dir.as_ref();
        let collector_dir = requested.canonicalize().map_err(|e| {
            AgentError::Config(format!("No such directory: {} ({})", requested.display(), e))
        })?;

        if !collector_dir.is_dir() {
            return Err(AgentError::Config(format!(
                "Collector root is not a directory: {}",
                collector_dir.display()
            ))
            .into());
        }

        info!("Using collector root {}", collector_dir.display());
        debug!(
            "Configuration in {}, plugins in {}",
            collector_dir.join(CONF_SUBDIR).display(),
            collector_dir.join(BUILTIN_SUBDIR).display()
        );

        let (queue, drain) = OutputQueue::channel();
        Ok((Self { collector_dir, queue }, drain))
    }

    /// Root collector directory
    pub fn collector_dir(&self) -> &Path {
        &self.collector_dir
    }

    /// Directory scanned for collector configuration files
    pub fn conf_dir(&self) -> PathBuf {
        self.collector_dir.join(CONF_SUBDIR)
    }

    /// Directory holding plugin files
    pub fn builtin_dir(&self) -> PathBuf {
        self.collector_dir.join(BUILTIN_SUBDIR)
    }

    /// Conventional plugin path for a collector name
    pub fn plugin_path(&self, name: &str) -> PathBuf {
        self.builtin_dir().join(name)
    }

    /// Producer handle for the shared output queue
    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }
}
