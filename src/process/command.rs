use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

use crate::process::{ProcessError, ProcessResult};

/// Command wrapper for bounded process execution
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to execute
    program: String,

    /// Arguments to pass to the program
    args: Vec<String>,

    /// Current working directory
    current_dir: Option<PathBuf>,

    /// Environment variables
    env_vars: HashMap<String, String>,
}

impl Command {
    /// Create a new command
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env_vars: HashMap::new(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    /// Set the current working directory
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars.insert(key.into(), val.into());
        self
    }

    /// Program this command runs
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the command to completion and return its non-empty stdout lines.
    ///
    /// The child leads its own process group and is spawned with
    /// `kill_on_drop`, so it is killed whenever the wait is abandoned. On
    /// timeout the whole group is killed, taking any processes the child
    /// started with it. Stderr is logged at debug level. A non-zero exit
    /// status is an error.
    pub async fn output_lines(&self, limit: Duration) -> ProcessResult<Vec<String>> {
        debug!("Running command: {} {:?}", self.program, self.args);

        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        for (key, val) in &self.env_vars {
            cmd.env(key, val);
        }

        let child = cmd.spawn().map_err(ProcessError::SpawnError)?;
        let pid = child.id();

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(ProcessError::ReadError)?,
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                warn!("[{}] killed after running longer than {:?}", self.program, limit);
                return Err(ProcessError::Timeout(limit));
            }
        };

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            debug!("[{}] stderr: {}", self.program, line);
        }

        if !output.status.success() {
            return Err(ProcessError::NonZeroExit(output.status));
        }

        let lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        trace!("[{}] produced {} lines", self.program, lines.len());

        Ok(lines)
    }
}

/// Send SIGKILL to every process in the group led by `pid`
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };

    // SAFETY: killpg takes plain integers and only delivers a signal
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!("killpg({}) failed: {}", pgid, std::io::Error::last_os_error());
    }
}
