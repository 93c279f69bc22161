use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};

use metricrelay::config::AgentConfig;
use metricrelay::context::AgentContext;
use metricrelay::registry::CollectorRegistry;
use metricrelay::scheduler::{Scheduler, SchedulerOptions};
use metricrelay::sender::{DEFAULT_PORT, Endpoint, Sender};
use metricrelay::util::pidfile::write_pid;
use metricrelay::{VERSION, init_logging};

/// Command line arguments; every flag overrides the configuration file
#[derive(Parser, Debug)]
#[command(
    name = "metricrelay",
    version,
    about = "Collects host metrics and relays them to a time-series database"
)]
struct Args {
    /// Agent configuration file (TOML)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Directory holding conf/ and builtin/
    #[arg(short = 'c', long)]
    collector_dir: Option<PathBuf>,

    /// Comma separated list of host[:port] endpoints
    #[arg(short = 'L', long)]
    hosts: Option<String>,

    /// Single endpoint host, ignored when --hosts is given
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port of the single endpoint
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Global tag key=value, may be repeated
    #[arg(short = 't', long = "tag")]
    tags: Vec<String>,

    /// Print batches instead of sending them
    #[arg(short = 'd', long)]
    dry_run: bool,

    /// Maximum number of tags per metric
    #[arg(long)]
    max_tags: Option<usize>,

    /// Seconds between ticks
    #[arg(long)]
    tick_period: Option<u64>,

    #[arg(long)]
    http_username: Option<String>,

    #[arg(long)]
    http_password: Option<String>,

    /// Deliver over https
    #[arg(long)]
    ssl: bool,

    /// Write the process id to this file
    #[arg(short = 'P', long)]
    pidfile: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Log to this file instead of stdout
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Rotate the log file at this size
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Rotated log files to keep
    #[arg(long)]
    backup_count: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(dir) = &self.collector_dir {
            config.collector_dir = dir.clone();
        }

        if let Some(hosts) = &self.hosts {
            config.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(String::from)
                .collect();
        } else if self.host.is_some() || self.port.is_some() {
            let host = self.host.clone().unwrap_or_else(|| "localhost".to_string());
            let endpoint = Endpoint::new(host, self.port.unwrap_or(DEFAULT_PORT));
            config.hosts = vec![endpoint.to_string()];
        }

        for tag in &self.tags {
            // A command line tag replaces a configured one with the same key
            let key = tag.split_once('=').map_or(tag.as_str(), |(key, _)| key);
            config
                .tags
                .retain(|existing| existing.split_once('=').is_none_or(|(k, _)| k != key));
            config.tags.push(tag.clone());
        }

        config.dry_run |= self.dry_run;
        config.http.ssl |= self.ssl;

        if let Some(max_tags) = self.max_tags {
            config.max_tags = max_tags;
        }
        if let Some(period) = self.tick_period {
            config.tick_period_secs = period;
        }
        if let Some(username) = &self.http_username {
            config.http.username = Some(username.clone());
        }
        if let Some(password) = &self.http_password {
            config.http.password = Some(password.clone());
        }
        if let Some(pidfile) = &self.pidfile {
            config.pidfile = Some(pidfile.clone());
        }
        if let Some(logfile) = &self.logfile {
            config.logging.file = Some(logfile.clone());
        }
        if let Some(max_bytes) = self.max_bytes {
            config.logging.max_bytes = max_bytes;
        }
        if let Some(backup_count) = self.backup_count {
            config.logging.backup_count = backup_count;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AgentConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    init_logging(&config.logging, args.verbose)?;
    info!("metricrelay {} starting", VERSION);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return Err(e);
    }

    if let Some(pidfile) = &config.pidfile {
        write_pid(pidfile)?;
    }

    let (context, drain) = match AgentContext::new(&config.collector_dir) {
        Ok(created) => created,
        Err(e) => {
            error!("Cannot use collector directory: {:#}", e);
            return Err(e);
        }
    };

    let registry = CollectorRegistry::new(context);
    let sender = Sender::from_config(&config)?;
    if sender.is_dry_run() {
        info!("Dry-run mode, nothing will be sent");
    }

    let mut scheduler = Scheduler::new(
        registry,
        drain,
        sender,
        SchedulerOptions::from_config(&config),
    );
    scheduler.run_until(shutdown_signal()).await;

    info!("exiting");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, shutting down"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, shutting down");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "metricrelay",
            "-c",
            "/opt/collectors",
            "-L",
            "tsd1:4243, tsd2",
            "-t",
            "dc=west",
            "-t",
            "rack=r1",
            "-d",
            "--ssl",
            "--max-tags",
            "4",
        ]);
        let mut config = AgentConfig {
            tags: vec!["dc=east".to_string(), "env=prod".to_string()],
            ..Default::default()
        };

        args.apply(&mut config);

        assert_eq!(config.collector_dir, PathBuf::from("/opt/collectors"));
        assert_eq!(config.hosts, vec!["tsd1:4243".to_string(), "tsd2".to_string()]);
        assert_eq!(
            config.tags,
            vec!["env=prod".to_string(), "dc=west".to_string(), "rack=r1".to_string()]
        );
        assert!(config.dry_run);
        assert!(config.http.ssl);
        assert_eq!(config.max_tags, 4);
    }

    #[test]
    fn test_single_host_and_port() {
        let args = Args::parse_from(["metricrelay", "-H", "::1", "-p", "4000"]);
        let mut config = AgentConfig::default();
        args.apply(&mut config);
        assert_eq!(config.hosts, vec!["[::1]:4000".to_string()]);

        let args = Args::parse_from(["metricrelay", "-p", "4000"]);
        let mut config = AgentConfig::default();
        args.apply(&mut config);
        assert_eq!(config.hosts, vec!["localhost:4000".to_string()]);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let args = Args::parse_from(["metricrelay"]);
        let mut config = AgentConfig::default();
        args.apply(&mut config);
        assert_eq!(config.hosts, AgentConfig::default().hosts);
        assert!(!config.dry_run);
    }
}
