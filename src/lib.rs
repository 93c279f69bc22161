//! A host metrics agent: hot-reloaded collectors, a fixed tick loop and
//! HTTP delivery to a time-series database

pub mod collector;
pub mod config;
pub mod confstore;
pub mod context;
pub mod error;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod util;

pub use util::logging::init as init_logging;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::collector::{Collector, CollectorContext, CollectorFactory, OutputQueue};
    pub use crate::config::{AgentConfig, ConfigBuilder};
    pub use crate::confstore::ConfigStore;
    pub use crate::context::AgentContext;
    pub use crate::error::{AgentError, Result};
    pub use crate::registry::CollectorRegistry;
    pub use crate::scheduler::{Scheduler, SchedulerOptions};
    pub use crate::sender::{MetricEntry, SendOutcome, Sender};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
