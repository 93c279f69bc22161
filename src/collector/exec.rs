use std::sync::Arc;
use std::time::Duration;

use crate::collector::core::{Collector, CollectorContext, CollectorFactory, CollectorLogger};
use crate::error::{AgentError, Result};
use crate::process::Command;

/// Class name the exec collector is registered under
pub const EXEC_CLASS: &str = "Exec";

/// Section of the collector configuration read by the exec collector
pub const SECTION_EXEC: &str = "exec";

/// Time limit for one run when the configuration does not set one
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 10;

/// Collector that runs an executable and returns its stdout lines
///
/// The executable defaults to the collector's plugin file. Configuration:
///
/// ```ini
/// [base]
/// enabled = true
/// collectorclass = Exec
///
/// [exec]
/// ; optional, defaults to the plugin file
/// command = /usr/local/bin/sampler
/// ; optional, whitespace separated
/// args = --format tsdb
/// ; seconds, default 10
/// timeout = 5
/// ```
pub struct ExecCollector {
    command: Command,
    limit: Duration,
    logger: CollectorLogger,
}

impl ExecCollector {
    /// Build from the context handed to a factory
    pub fn from_context(ctx: &CollectorContext) -> Result<Self> {
        let program = match ctx.config.get(SECTION_EXEC, "command") {
            Some(command) => command.to_string(),
            None => ctx.plugin_path.to_string_lossy().into_owned(),
        };

        let args = ctx
            .config
            .get(SECTION_EXEC, "args")
            .map(|args| args.split_whitespace().map(String::from).collect::<Vec<_>>())
            .unwrap_or_default();

        let timeout_secs = match ctx.config.get(SECTION_EXEC, "timeout") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                AgentError::plugin_load(&ctx.name, format!("invalid exec timeout {:?}: {}", raw, e))
            })?,
            None => DEFAULT_EXEC_TIMEOUT_SECS,
        };

        let mut command = Command::new(program)
            .args(args)
            .env("METRICRELAY_COLLECTOR", ctx.name.clone())
            .env("METRICRELAY_INTERVAL", ctx.config.interval.as_secs().to_string());

        if let Some(dir) = ctx.plugin_path.parent() {
            command = command.current_dir(dir);
        }

        Ok(Self {
            command,
            limit: Duration::from_secs(timeout_secs),
            logger: ctx.logger.clone(),
        })
    }

    /// Factory suitable for registering under [`EXEC_CLASS`]
    pub fn factory() -> CollectorFactory {
        Arc::new(|ctx: CollectorContext| -> Result<Arc<dyn Collector>> {
            let collector: Arc<dyn Collector> = Arc::new(ExecCollector::from_context(&ctx)?);
            Ok(collector)
        })
    }
}

#[async_trait::async_trait]
impl Collector for ExecCollector {
    async fn collect(&self) -> Result<Option<Vec<String>>> {
        let lines = self
            .command
            .output_lines(self.limit)
            .await
            .map_err(AgentError::from)?;

        self.logger
            .debug(format!("{} returned {} lines", self.command.program(), lines.len()));

        Ok(Some(lines))
    }
}
