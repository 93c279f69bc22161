use log::debug;
use std::fs;
use std::path::Path;

use crate::error::{AgentError, Result};

/// Write the current process id to `path`, replacing any previous content
pub fn write_pid(path: &Path) -> Result<()> {
    let pid = std::process::id();
    fs::write(path, format!("{}\n", pid)).map_err(|e| {
        AgentError::Config(format!("Failed to write pid file {}: {}", path.display(), e))
    })?;
    debug!("Wrote pid {} to {}", pid, path.display());
    Ok(())
}
