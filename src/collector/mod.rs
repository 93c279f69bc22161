mod config;
mod core;
mod exec;

// Re-export public items
pub use config::{CollectorConfig, CollectorSettings, DEFAULT_INTERVAL_SECS, SECTION_BASE};
pub use core::{
    Collector, CollectorContext, CollectorFactory, CollectorLogger, OutputDrain, OutputQueue,
};
pub use exec::{DEFAULT_EXEC_TIMEOUT_SECS, EXEC_CLASS, ExecCollector, SECTION_EXEC};
