//! Fixed-period tick loop: reload, invoke, aggregate, send
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

use crate::collector::OutputDrain;
use crate::config::AgentConfig;
use crate::confstore::ConfigStore;
use crate::error::{AgentError, Result};
use crate::registry::{ApplyReport, CollectorRegistry, WorkerHandle};
use crate::sender::{SendOutcome, Sender};

/// Tunables of the tick loop
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub tick_period: Duration,
    /// Upper bound on one collector invocation, `None` for unbounded
    pub invocation_timeout: Option<Duration>,
    /// Skip collectors whose declared interval has not elapsed
    pub honor_intervals: bool,
    /// Retract collectors whose configuration file disappeared
    pub unload_removed: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(2),
            invocation_timeout: Some(Duration::from_secs(30)),
            honor_intervals: false,
            unload_removed: true,
        }
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            tick_period: config.tick_period(),
            invocation_timeout: config.invocation_timeout(),
            honor_intervals: config.honor_intervals,
            unload_removed: config.unload_removed,
        }
    }
}

/// Summary of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Result of applying configuration changes
    pub applied: ApplyReport,
    /// Collectors retracted because their configuration vanished
    pub retracted: Vec<String>,
    /// Collectors invoked this tick, in order
    pub invoked: Vec<String>,
    /// Collectors whose invocation failed
    pub failed: Vec<String>,
    /// Collectors skipped because a timed-out invocation is still running
    pub stalled: Vec<String>,
    /// Lines aggregated into the batch
    pub lines: usize,
    pub outcome: SendOutcome,
    pub elapsed: Duration,
}

/// Owns the registry, the config store and the sender and drives them
pub struct Scheduler {
    store: ConfigStore,
    registry: CollectorRegistry,
    drain: OutputDrain,
    sender: Sender,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        registry: CollectorRegistry,
        drain: OutputDrain,
        sender: Sender,
        options: SchedulerOptions,
    ) -> Self {
        let store = ConfigStore::new(registry.context().conf_dir());
        Self {
            store,
            registry,
            drain,
            sender,
            options,
        }
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    /// Run one complete tick
    pub async fn tick(&mut self) -> TickReport {
        let start = Instant::now();

        let (applied, retracted) = self.reload().await;

        let mut lines = Vec::new();
        let mut invoked = Vec::new();
        let mut failed = Vec::new();
        let mut stalled = Vec::new();

        for name in self.registry.names() {
            let Some(handle) = self.registry.get_mut(&name) else {
                continue;
            };
            if self.options.honor_intervals && !handle.is_due(start) {
                continue;
            }
            if handle.is_stalled() {
                warn!("{} is still running a timed-out invocation, skipped", name);
                stalled.push(name);
                continue;
            }
            handle.mark_invoked(start);

            invoked.push(name.clone());
            match invoke(handle, self.options.invocation_timeout).await {
                Ok(output) => lines.extend(output),
                Err(e) => {
                    error!("{:#}", e);
                    failed.push(name);
                }
            }
        }

        lines.extend(self.drain.drain());
        let line_count = lines.len();
        debug!(
            "Tick invoked {} collectors, {} failed, {} lines",
            invoked.len(),
            failed.len(),
            line_count
        );

        let outcome = self.sender.send(lines).await;

        TickReport {
            applied,
            retracted,
            invoked,
            failed,
            stalled,
            lines: line_count,
            outcome,
            elapsed: start.elapsed(),
        }
    }

    /// Tick every period until `shutdown` resolves
    ///
    /// A tick that overruns the period is followed immediately by the next
    /// one; missed ticks are not caught up. Data of an interrupted tick is
    /// dropped.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "Scheduler started, tick period {:?}",
            self.options.tick_period
        );

        loop {
            let report = tokio::select! {
                _ = &mut shutdown => break,
                report = self.tick() => report,
            };

            let pause = self.options.tick_period.saturating_sub(report.elapsed);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(pause) => {}
            }
        }

        info!("Scheduler stopped");
    }

    async fn reload(&mut self) -> (ApplyReport, Vec<String>) {
        let before = self.store.tracked_names();
        let changed = self.store.refresh();

        let mut retracted = Vec::new();
        if self.options.unload_removed {
            let after = self.store.tracked_names();
            for name in before.difference(&after) {
                if self.registry.retract(name).await {
                    retracted.push(name.clone());
                }
            }
        }

        let applied = if changed.is_empty() {
            ApplyReport::default()
        } else {
            self.registry.apply(changed).await
        };

        (applied, retracted)
    }
}

/// Run one collection on its own task so a panic stays contained
///
/// A task that outlives `limit` is aborted. Abort only takes effect at an
/// await point, so a collector blocking its thread keeps running; the handle
/// is marked stalled until that task finishes.
async fn invoke(handle: &mut WorkerHandle, limit: Option<Duration>) -> Result<Vec<String>> {
    let name = handle.name().to_string();
    let collector = Arc::clone(handle.collector());
    let mut task = tokio::spawn(async move { collector.collect().await });

    let joined = match limit {
        Some(limit) => match timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                handle.mark_stalled(task.abort_handle());
                return Err(
                    AgentError::invocation(&name, format!("timed out after {:?}", limit)).into(),
                );
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(lines)) => Ok(lines.unwrap_or_default()),
        Ok(Err(e)) => Err(AgentError::invocation(&name, format!("{:#}", e)).into()),
        Err(e) if e.is_panic() => Err(AgentError::invocation(&name, "panicked").into()),
        Err(e) => Err(AgentError::invocation(&name, e).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Collector, OutputQueue};
    use crate::context::AgentContext;
    use crate::sender::{Endpoint, EndpointRotation, LineParser, Tags, Transport};
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn deliver(
            &self,
            endpoint: &Endpoint,
            _: &[crate::sender::MetricEntry],
        ) -> Result<()> {
            Err(AgentError::Delivery {
                endpoint: endpoint.to_string(),
                reason: "unexpected delivery in dry-run".to_string(),
            }
            .into())
        }
    }

    struct Lines(Vec<String>);

    #[async_trait]
    impl Collector for Lines {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            Ok(Some(self.0.clone()))
        }
    }

    struct Failing;

    #[async_trait]
    impl Collector for Failing {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            Err(AgentError::Other("sensor unavailable".to_string()).into())
        }
    }

    struct Hanging;

    #[async_trait]
    impl Collector for Hanging {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    struct Panicking;

    #[async_trait]
    impl Collector for Panicking {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            panic!("collector bug");
        }
    }

    /// Holds its worker thread without yielding
    struct Blocking(Arc<AtomicUsize>);

    #[async_trait]
    impl Collector for Blocking {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(600));
            Ok(None)
        }
    }

    struct Pushing(OutputQueue);

    #[async_trait]
    impl Collector for Pushing {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            self.0.push("queued.metric 100 3");
            Ok(None)
        }
    }

    fn add_collector(root: &Path, name: &str, class: &str, extra: &str) {
        fs::create_dir_all(root.join("builtin")).unwrap();
        fs::create_dir_all(root.join("conf")).unwrap();
        fs::write(root.join("builtin").join(name), "plugin").unwrap();
        fs::write(
            root.join("conf").join(format!("{}.conf", name)),
            format!("[base]\nenabled = true\ncollectorclass = {}\n{}", class, extra),
        )
        .unwrap();
    }

    fn scheduler(root: &Path, options: SchedulerOptions) -> Scheduler {
        fs::create_dir_all(root.join("builtin")).unwrap();
        fs::create_dir_all(root.join("conf")).unwrap();
        let (ctx, drain) = AgentContext::new(root).unwrap();

        let mut registry = CollectorRegistry::new(ctx);
        registry.register_fn("Ok", |_| {
            let collector: Arc<dyn Collector> = Arc::new(Lines(vec!["a.b 100 1".to_string()]));
            Ok(collector)
        });
        registry.register_fn("Failing", |_| {
            let collector: Arc<dyn Collector> = Arc::new(Failing);
            Ok(collector)
        });
        registry.register_fn("Hanging", |_| {
            let collector: Arc<dyn Collector> = Arc::new(Hanging);
            Ok(collector)
        });
        registry.register_fn("Panicking", |_| {
            let collector: Arc<dyn Collector> = Arc::new(Panicking);
            Ok(collector)
        });
        registry.register_fn("Pushing", |ctx| {
            let collector: Arc<dyn Collector> = Arc::new(Pushing(ctx.queue));
            Ok(collector)
        });

        let rotation = EndpointRotation::new(vec![Endpoint::new("localhost", 4242)]).unwrap();
        let sender = Sender::new(LineParser::new(Tags::new(), 8), rotation, Box::new(NoTransport))
            .with_dry_run(true);

        Scheduler::new(registry, drain, sender, options)
    }

    fn dry_run_entries(outcome: &SendOutcome) -> Vec<String> {
        match outcome {
            SendOutcome::DryRun(entries) => entries.iter().map(|e| e.metric.clone()).collect(),
            other => panic!("expected dry-run outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_collector_does_not_suppress_others() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        add_collector(dir.path(), "bad", "Failing", "");
        let mut scheduler = scheduler(dir.path(), SchedulerOptions::default());

        let report = scheduler.tick().await;

        assert_eq!(report.applied.loaded.len(), 2);
        assert_eq!(report.invoked, vec!["bad".to_string(), "good".to_string()]);
        assert_eq!(report.failed, vec!["bad".to_string()]);
        assert_eq!(report.lines, 1);
        assert_eq!(dry_run_entries(&report.outcome), vec!["a.b".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_lines_are_aggregated() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        add_collector(dir.path(), "pusher", "Pushing", "");
        let mut scheduler = scheduler(dir.path(), SchedulerOptions::default());

        let report = scheduler.tick().await;

        assert!(report.failed.is_empty());
        assert_eq!(report.lines, 2);
        assert_eq!(
            dry_run_entries(&report.outcome),
            vec!["a.b".to_string(), "queued.metric".to_string()]
        );
    }

    #[tokio::test]
    async fn test_hanging_collector_times_out() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        add_collector(dir.path(), "stuck", "Hanging", "");
        let options = SchedulerOptions {
            invocation_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut scheduler = scheduler(dir.path(), options);

        let report = scheduler.tick().await;

        assert_eq!(report.failed, vec!["stuck".to_string()]);
        assert_eq!(report.lines, 1);
        assert!(report.elapsed < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_collector_is_not_stacked() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        add_collector(dir.path(), "blocked", "Blocking", "");
        let options = SchedulerOptions {
            invocation_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut scheduler = scheduler(dir.path(), options);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        scheduler.registry.register_fn("Blocking", move |_| {
            let collector: Arc<dyn Collector> = Arc::new(Blocking(Arc::clone(&counter)));
            Ok(collector)
        });

        let first = scheduler.tick().await;
        let second = scheduler.tick().await;

        assert_eq!(first.failed, vec!["blocked".to_string()]);
        assert_eq!(second.stalled, vec!["blocked".to_string()]);
        assert_eq!(second.invoked, vec!["good".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(800)).await;
        let third = scheduler.tick().await;

        assert!(third.stalled.is_empty());
        assert_eq!(third.invoked, vec!["blocked".to_string(), "good".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_collector_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        add_collector(dir.path(), "buggy", "Panicking", "");
        let mut scheduler = scheduler(dir.path(), SchedulerOptions::default());

        let report = scheduler.tick().await;

        assert_eq!(report.failed, vec!["buggy".to_string()]);
        assert_eq!(dry_run_entries(&report.outcome), vec!["a.b".to_string()]);
    }

    #[tokio::test]
    async fn test_unchanged_configs_are_not_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        let mut scheduler = scheduler(dir.path(), SchedulerOptions::default());

        let first = scheduler.tick().await;
        let second = scheduler.tick().await;

        assert_eq!(first.applied.loaded, vec!["good".to_string()]);
        assert_eq!(second.applied, ApplyReport::default());
        assert_eq!(second.invoked, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_removed_config_retracts_collector() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        add_collector(dir.path(), "other", "Ok", "");
        let mut scheduler = scheduler(dir.path(), SchedulerOptions::default());
        scheduler.tick().await;
        assert_eq!(scheduler.registry().len(), 2);

        fs::remove_file(dir.path().join("conf").join("other.conf")).unwrap();
        let report = scheduler.tick().await;

        assert_eq!(report.retracted, vec!["other".to_string()]);
        assert_eq!(report.invoked, vec!["good".to_string()]);
        assert!(scheduler.registry().get("other").is_none());
    }

    #[tokio::test]
    async fn test_removed_config_kept_when_unloading_disabled() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        let options = SchedulerOptions {
            unload_removed: false,
            ..Default::default()
        };
        let mut scheduler = scheduler(dir.path(), options);
        scheduler.tick().await;

        fs::remove_file(dir.path().join("conf").join("good.conf")).unwrap();
        let report = scheduler.tick().await;

        assert!(report.retracted.is_empty());
        assert_eq!(report.invoked, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_honor_intervals_skips_collectors_not_due() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "fast", "Ok", "interval = 0\n");
        add_collector(dir.path(), "slow", "Ok", "interval = 3600\n");
        let options = SchedulerOptions {
            honor_intervals: true,
            ..Default::default()
        };
        let mut scheduler = scheduler(dir.path(), options);

        let first = scheduler.tick().await;
        let second = scheduler.tick().await;

        assert_eq!(first.invoked, vec!["fast".to_string(), "slow".to_string()]);
        assert_eq!(second.invoked, vec!["fast".to_string()]);
    }

    #[tokio::test]
    async fn test_no_collectors_sends_empty_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), SchedulerOptions::default());

        let report = scheduler.tick().await;

        assert!(report.invoked.is_empty());
        assert_eq!(report.outcome, SendOutcome::DryRun(Vec::new()));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        add_collector(dir.path(), "good", "Ok", "");
        let options = SchedulerOptions {
            tick_period: Duration::from_millis(10),
            ..Default::default()
        };
        let mut scheduler = scheduler(dir.path(), options);

        timeout(
            Duration::from_secs(5),
            scheduler.run_until(sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap();

        assert_eq!(scheduler.registry().len(), 1);
    }
}
