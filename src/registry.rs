//! Collector registry: the hot-reloaded table of active workers
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::AbortHandle;

use crate::collector::{
    Collector, CollectorConfig, CollectorContext, CollectorFactory, CollectorLogger,
    EXEC_CLASS, ExecCollector,
};
use crate::context::AgentContext;
use crate::error::{AgentError, Result};

/// An active collector together with its scheduling metadata
pub struct WorkerHandle {
    name: String,
    collector: Arc<dyn Collector>,
    interval: Duration,
    plugin_modified: SystemTime,
    next_due: Option<Instant>,
    stalled: Option<AbortHandle>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("plugin_modified", &self.plugin_modified)
            .field("next_due", &self.next_due)
            .field("stalled", &self.stalled.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collector instance
    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.collector
    }

    /// Declared collection interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Plugin file modification time recorded when this handle was built
    pub fn plugin_modified(&self) -> SystemTime {
        self.plugin_modified
    }

    /// Whether the declared interval has elapsed since the last invocation
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due.is_none_or(|due| now >= due)
    }

    /// Record an invocation started at `now`
    pub fn mark_invoked(&mut self, now: Instant) {
        self.next_due = Some(now + self.interval);
    }

    /// Remember an invocation task that timed out and may still be running
    pub fn mark_stalled(&mut self, task: AbortHandle) {
        self.stalled = Some(task);
    }

    /// Whether a timed-out invocation of this collector has not finished yet
    pub fn is_stalled(&mut self) -> bool {
        match &self.stalled {
            Some(task) if !task.is_finished() => true,
            _ => {
                self.stalled = None;
                false
            }
        }
    }
}

/// What one [`CollectorRegistry::apply`] call did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyReport {
    /// Collectors that were loaded or reloaded
    pub loaded: Vec<String>,
    /// Collectors that were disabled and removed
    pub removed: Vec<String>,
    /// Enabled collectors whose plugin file could not be accessed
    pub skipped: Vec<String>,
    /// Collectors that failed to load, with the reason
    pub failed: Vec<(String, String)>,
}

/// Registry of active collectors keyed by name
///
/// Collector classes are resolved through an explicit table of factories.
/// The built-in [`ExecCollector`] is registered under [`EXEC_CLASS`].
pub struct CollectorRegistry {
    context: AgentContext,
    factories: HashMap<String, CollectorFactory>,
    handles: BTreeMap<String, WorkerHandle>,
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("classes", &self.factories.keys().collect::<Vec<_>>())
            .field("handles", &self.handles)
            .finish()
    }
}

impl CollectorRegistry {
    /// Create a registry with the built-in collector classes registered
    pub fn new(context: AgentContext) -> Self {
        let mut registry = Self::without_builtins(context);
        registry.register(EXEC_CLASS, ExecCollector::factory());
        registry
    }

    /// Create a registry with an empty factory table
    pub fn without_builtins(context: AgentContext) -> Self {
        Self {
            context,
            factories: HashMap::new(),
            handles: BTreeMap::new(),
        }
    }

    /// Register a factory under a class name, replacing any previous one
    pub fn register(
        &mut self,
        class_name: impl Into<String>,
        factory: CollectorFactory,
    ) -> &mut Self {
        let class_name = class_name.into();
        debug!("Registered collector class {}", class_name);
        self.factories.insert(class_name, factory);
        self
    }

    /// Register a plain function or closure as a factory
    pub fn register_fn<F>(&mut self, class_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(CollectorContext) -> Result<Arc<dyn Collector>> + Send + Sync + 'static,
    {
        self.register(class_name, Arc::new(factory))
    }

    /// Apply changed configurations to the handle table.
    ///
    /// A failure while handling one configuration is logged and recorded in
    /// the report; the remaining configurations are still applied and any
    /// handle already installed for the failing name is left as it was.
    pub async fn apply(&mut self, changed: Vec<CollectorConfig>) -> ApplyReport {
        let mut report = ApplyReport::default();

        for config in changed {
            let name = config.name().to_string();
            if let Err(e) = self.apply_one(&config, &mut report).await {
                error!("Failed to load collector {}, skipped: {:#}", name, e);
                report.failed.push((name, format!("{:#}", e)));
            }
        }

        report
    }

    async fn apply_one(
        &mut self,
        config: &CollectorConfig,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let name = config.name().to_string();

        if !config.settings.enabled {
            if let Some(previous) = self.handles.remove(&name) {
                info!("{} is disabled", name);
                release(previous).await;
                report.removed.push(name);
            }
            return Ok(());
        }

        let plugin_path = self.context.plugin_path(&name);
        let plugin_modified = match plugin_modification_time(&plugin_path) {
            Ok(modified) => modified,
            Err(e) => {
                warn!("Failed to access collector file {}: {}", plugin_path.display(), e);
                report.skipped.push(name);
                return Ok(());
            }
        };

        if let Some(existing) = self.handles.get(&name) {
            if existing.plugin_modified >= plugin_modified {
                debug!("Collector {} is up to date", name);
                return Ok(());
            }
        }

        let class_name = config
            .settings
            .collector_class
            .clone()
            .unwrap_or_else(|| default_class_name(&name));

        let factory = self.factories.get(&class_name).cloned().ok_or_else(|| {
            AgentError::plugin_load(&name, format!("no collector class named {}", class_name))
        })?;

        let ctx = CollectorContext {
            name: name.clone(),
            plugin_path: plugin_path.clone(),
            config: config.settings.clone(),
            logger: CollectorLogger::new(&name),
            queue: self.context.queue().clone(),
        };

        // Build first so a failing factory leaves the old handle in place
        let collector =
            factory(ctx).map_err(|e| AgentError::plugin_load(&name, format!("{:#}", e)))?;

        let handle = WorkerHandle {
            name: name.clone(),
            collector,
            interval: config.settings.interval,
            plugin_modified,
            next_due: None,
            stalled: None,
        };

        if let Some(previous) = self.handles.insert(name.clone(), handle) {
            release(previous).await;
        }

        info!(
            "Loaded collector {} from {} as {}",
            name,
            plugin_path.display(),
            class_name
        );
        report.loaded.push(name);

        Ok(())
    }

    /// Remove the handle for a collector whose configuration disappeared
    pub async fn retract(&mut self, name: &str) -> bool {
        match self.handles.remove(name) {
            Some(previous) => {
                info!("Unloading collector {}, its configuration was removed", name);
                release(previous).await;
                true
            }
            None => false,
        }
    }

    /// Handle for a collector name
    pub fn get(&self, name: &str) -> Option<&WorkerHandle> {
        self.handles.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut WorkerHandle> {
        self.handles.get_mut(name)
    }

    /// Active handles in name order
    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.handles.values()
    }

    /// Active handles in name order, mutably
    pub fn handles_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
        self.handles.values_mut()
    }

    /// Names of active collectors in order
    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Shared runtime context
    pub fn context(&self) -> &AgentContext {
        &self.context
    }
}

/// Class name derived from a collector name when none is configured.
///
/// Each alphanumeric segment is capitalised and the segments are joined, so
/// `docker_alauda` becomes `DockerAlauda`.
pub fn default_class_name(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect()
}

fn plugin_modification_time(path: &Path) -> std::io::Result<SystemTime> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    // Opening proves the file is readable
    File::open(path)?;
    metadata.modified()
}

async fn release(handle: WorkerHandle) {
    if let Err(e) = handle.collector.cleanup().await {
        warn!("Cleanup of collector {} failed: {:#}", handle.name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorSettings;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticCollector {
        lines: Vec<String>,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Collector for StaticCollector {
        async fn collect(&self) -> Result<Option<Vec<String>>> {
            Ok(Some(self.lines.clone()))
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        registry: CollectorRegistry,
        builds: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("builtin")).unwrap();
        fs::create_dir_all(dir.path().join("conf")).unwrap();
        let (ctx, _drain) = AgentContext::new(dir.path()).unwrap();

        let builds = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut registry = CollectorRegistry::new(ctx);

        let counter = Arc::clone(&builds);
        let cleanup_counter = Arc::clone(&cleanups);
        registry.register_fn("Ntp", move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            let collector: Arc<dyn Collector> = Arc::new(StaticCollector {
                lines: vec![format!("{}.up 100 1", ctx.name)],
                cleanups: Arc::clone(&cleanup_counter),
            });
            Ok(collector)
        });
        registry.register_fn("Broken", |ctx| {
            Err(AgentError::Other(format!("{} cannot start", ctx.name)).into())
        });

        Fixture {
            dir,
            registry,
            builds,
            cleanups,
        }
    }

    fn touch_plugin(dir: &Path, name: &str, secs: u64) {
        let path = dir.join("builtin").join(name);
        fs::write(&path, "plugin").unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + secs))
            .unwrap();
    }

    fn conf(name: &str, enabled: bool, class: Option<&str>) -> CollectorConfig {
        let mut settings = CollectorSettings::default();
        settings.enabled = enabled;
        settings.interval = Duration::from_secs(30);
        settings.collector_class = class.map(String::from);
        CollectorConfig {
            filename: format!("{}.conf", name),
            path: PathBuf::from(format!("/conf/{}.conf", name)),
            settings,
            modified: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_enable_then_disable() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);

        let report = fx.registry.apply(vec![conf("ntp", true, None)]).await;
        assert_eq!(report.loaded, vec!["ntp".to_string()]);
        assert_eq!(fx.registry.len(), 1);

        let handle = fx.registry.get("ntp").unwrap();
        assert_eq!(handle.interval(), Duration::from_secs(30));
        let lines = handle.collector().collect().await.unwrap().unwrap();
        assert_eq!(lines, vec!["ntp.up 100 1"]);

        let report = fx.registry.apply(vec![conf("ntp", false, None)]).await;
        assert_eq!(report.removed, vec!["ntp".to_string()]);
        assert!(fx.registry.is_empty());
        assert_eq!(fx.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchanged_plugin_is_not_reloaded() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);

        fx.registry.apply(vec![conf("ntp", true, None)]).await;
        let first = Arc::clone(fx.registry.get("ntp").unwrap().collector());

        let report = fx.registry.apply(vec![conf("ntp", true, None)]).await;
        assert!(report.loaded.is_empty());

        let second = fx.registry.get("ntp").unwrap().collector();
        assert!(Arc::ptr_eq(&first, second));
        assert_eq!(fx.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_newer_plugin_is_reloaded() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);
        fx.registry.apply(vec![conf("ntp", true, None)]).await;
        let first = Arc::clone(fx.registry.get("ntp").unwrap().collector());

        touch_plugin(fx.dir.path(), "ntp", 60);
        let report = fx.registry.apply(vec![conf("ntp", true, None)]).await;

        assert_eq!(report.loaded, vec!["ntp".to_string()]);
        assert!(!Arc::ptr_eq(&first, fx.registry.get("ntp").unwrap().collector()));
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(fx.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_plugin_keeps_previous_handle() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);
        fx.registry.apply(vec![conf("ntp", true, None)]).await;

        fs::remove_file(fx.dir.path().join("builtin").join("ntp")).unwrap();
        let report = fx.registry.apply(vec![conf("ntp", true, None)]).await;

        assert_eq!(report.skipped, vec!["ntp".to_string()]);
        assert!(fx.registry.get("ntp").is_some());
    }

    #[tokio::test]
    async fn test_failing_factory_is_isolated() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);
        touch_plugin(fx.dir.path(), "flaky", 0);
        touch_plugin(fx.dir.path(), "mystery", 0);

        let report = fx
            .registry
            .apply(vec![
                conf("flaky", true, Some("Broken")),
                conf("mystery", true, None),
                conf("ntp", true, None),
            ])
            .await;

        assert_eq!(report.loaded, vec!["ntp".to_string()]);
        let failed: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(failed, vec!["flaky", "mystery"]);
        assert!(report.failed[1].1.contains("Mystery"));
        assert_eq!(fx.registry.names(), vec!["ntp".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_handle() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);
        fx.registry.apply(vec![conf("ntp", true, None)]).await;
        let first = Arc::clone(fx.registry.get("ntp").unwrap().collector());

        touch_plugin(fx.dir.path(), "ntp", 60);
        let report = fx.registry.apply(vec![conf("ntp", true, Some("Broken"))]).await;

        assert_eq!(report.failed.len(), 1);
        assert!(Arc::ptr_eq(&first, fx.registry.get("ntp").unwrap().collector()));
    }

    #[tokio::test]
    async fn test_disabled_unknown_collector_is_noop() {
        let mut fx = fixture();
        let report = fx.registry.apply(vec![conf("ntp", false, None)]).await;
        assert_eq!(report, ApplyReport::default());
    }

    #[tokio::test]
    async fn test_retract() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "ntp", 0);
        fx.registry.apply(vec![conf("ntp", true, None)]).await;

        assert!(fx.registry.retract("ntp").await);
        assert!(!fx.registry.retract("ntp").await);
        assert!(fx.registry.is_empty());
        assert_eq!(fx.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_builtin_exec_class_is_registered() {
        let mut fx = fixture();
        touch_plugin(fx.dir.path(), "sampler", 0);

        let report = fx.registry.apply(vec![conf("sampler", true, Some(EXEC_CLASS))]).await;
        assert_eq!(report.loaded, vec!["sampler".to_string()]);
    }

    #[test]
    fn test_default_class_name() {
        assert_eq!(default_class_name("ntp"), "Ntp");
        assert_eq!(default_class_name("docker_alauda"), "DockerAlauda");
        assert_eq!(default_class_name("cloud-mon"), "CloudMon");
        assert_eq!(default_class_name("SPARK"), "Spark");
        assert_eq!(default_class_name("__odd__name"), "OddName");
    }

    #[test]
    fn test_handle_due_tracking() {
        let mut handle = WorkerHandle {
            name: "ntp".to_string(),
            collector: Arc::new(StaticCollector {
                lines: Vec::new(),
                cleanups: Arc::new(AtomicUsize::new(0)),
            }),
            interval: Duration::from_secs(15),
            plugin_modified: SystemTime::UNIX_EPOCH,
            next_due: None,
            stalled: None,
        };

        let now = Instant::now();
        assert!(handle.is_due(now));
        handle.mark_invoked(now);
        assert!(!handle.is_due(now + Duration::from_secs(14)));
        assert!(handle.is_due(now + Duration::from_secs(15)));
    }
}
