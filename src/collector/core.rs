//! Core collector traits and types
use crate::collector::config::CollectorSettings;
use crate::error::Result;
use log::Level;
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capability every collector plugin provides
///
/// A collector either returns the lines it gathered (`Some(lines)`) or pushes
/// them onto the shared [`OutputQueue`] it was constructed with and returns
/// `None`. Both styles may be mixed freely.
///
/// `collect` runs on a runtime worker and a timeout can only cancel it at an
/// `.await`. Blocking work (file reads, sleeps, synchronous clients) belongs
/// in `tokio::task::spawn_blocking`. A collector that blocks anyway and
/// outlives the invocation timeout is skipped until that call returns.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Run one collection
    async fn collect(&self) -> Result<Option<Vec<String>>>;

    /// Release resources when the collector is disabled, replaced or removed
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Constructor registered for a collector class name
pub type CollectorFactory =
    Arc<dyn Fn(CollectorContext) -> Result<Arc<dyn Collector>> + Send + Sync>;

/// Everything a factory receives to build a collector
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Logical collector name (config filename minus extension)
    pub name: String,
    /// Resolved plugin file backing this collector
    pub plugin_path: PathBuf,
    /// Parsed collector configuration
    pub config: CollectorSettings,
    /// Logger scoped to this collector
    pub logger: CollectorLogger,
    /// Shared output queue
    pub queue: OutputQueue,
}

/// Logger that tags every record with the collector it came from
#[derive(Debug, Clone)]
pub struct CollectorLogger {
    target: String,
}

impl CollectorLogger {
    pub fn new(name: &str) -> Self {
        Self {
            target: format!("collector::{}", name),
        }
    }

    /// Log target used for this collector's records
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: Level, message: impl Display) {
        log::log!(target: self.target.as_str(), level, "{}", message);
    }

    pub fn debug(&self, message: impl Display) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Display) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Display) {
        self.log(Level::Error, message);
    }
}

/// Producer side of the shared output queue
///
/// Cheap to clone and safe to use from any task or thread.
#[derive(Clone)]
pub struct OutputQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl OutputQueue {
    /// Create a queue and the single consumer that drains it
    pub fn channel() -> (OutputQueue, OutputDrain) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputQueue { tx }, OutputDrain { rx })
    }

    /// Push a raw metric line. Returns false once the consumer is gone.
    pub fn push(&self, line: impl Into<String>) -> bool {
        self.tx.send(line.into()).is_ok()
    }
}

/// Consumer side of the shared output queue
#[derive(Debug)]
pub struct OutputDrain {
    rx: mpsc::UnboundedReceiver<String>,
}

impl OutputDrain {
    /// Take every line queued so far without waiting for more
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }
        lines
    }
}
