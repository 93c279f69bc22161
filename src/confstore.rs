//! Tracking of collector configuration files and their modifications
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::collector::{CollectorConfig, CollectorSettings};

/// Extension recognised as a collector configuration file
pub const CONF_EXTENSION: &str = "conf";

/// In-memory view of the configuration directory
///
/// Rebuilt from the filesystem on every [`ConfigStore::refresh`]; nothing is
/// persisted.
#[derive(Debug)]
pub struct ConfigStore {
    conf_dir: PathBuf,
    tracked: BTreeMap<String, CollectorConfig>,
    /// Modification times of file revisions that failed to parse
    rejected: HashMap<String, SystemTime>,
}

impl ConfigStore {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            tracked: BTreeMap::new(),
            rejected: HashMap::new(),
        }
    }

    /// Rescan the directory and return the configurations that were added or
    /// modified since the previous scan.
    ///
    /// Files that disappeared are dropped from the tracked set without being
    /// reported; compare [`ConfigStore::tracked_names`] before and after to
    /// see them. A file that fails to parse is skipped and whatever was
    /// tracked for it before stays in effect.
    pub fn refresh(&mut self) -> Vec<CollectorConfig> {
        let current = self.list_confs();

        self.tracked.retain(|filename, config| {
            let present = current.contains_key(filename);
            if !present {
                info!("{} has been removed", config.path.display());
            }
            present
        });
        self.rejected.retain(|filename, _| current.contains_key(filename));

        let mut changed = Vec::new();

        for (filename, path) in current {
            let modified = match modification_time(&path) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            let known = self.tracked.get(&filename).map(|config| config.modified);
            if known.is_some_and(|previous| modified <= previous) {
                continue;
            }

            if self.rejected.get(&filename) == Some(&modified) {
                continue;
            }

            if known.is_some() {
                info!("Reloading {}, file has changed", path.display());
            } else {
                info!("Adding conf {}", path.display());
            }

            match CollectorSettings::from_file(&path) {
                Ok(settings) => {
                    self.rejected.remove(&filename);
                    let config = CollectorConfig {
                        filename: filename.clone(),
                        path,
                        settings,
                        modified,
                    };
                    self.tracked.insert(filename, config.clone());
                    changed.push(config);
                }
                Err(e) => {
                    error!("Skipping unparseable conf {}: {:#}", path.display(), e);
                    self.rejected.insert(filename, modified);
                }
            }
        }

        if !changed.is_empty() {
            debug!("{} collector configurations changed", changed.len());
        }

        changed
    }

    /// Collector names of every tracked configuration
    pub fn tracked_names(&self) -> BTreeSet<String> {
        self.tracked
            .values()
            .map(|config| config.name().to_string())
            .collect()
    }

    /// Tracked configuration for a file name
    pub fn get(&self, filename: &str) -> Option<&CollectorConfig> {
        self.tracked.get(filename)
    }

    /// Number of tracked configurations
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Directory being scanned
    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    fn list_confs(&self) -> BTreeMap<String, PathBuf> {
        let entries = match fs::read_dir(&self.conf_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Collector conf directory {} is not readable: {}",
                    self.conf_dir.display(),
                    e
                );
                return BTreeMap::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().is_some_and(|ext| ext == CONF_EXTENSION))
            .filter_map(|path| {
                let filename = path.file_name()?.to_str()?.to_string();
                Some((filename, path))
            })
            .collect()
    }
}

fn modification_time(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}
