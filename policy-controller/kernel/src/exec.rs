use crate::KernelError;
use std::{
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
};
use tracing::{debug, trace};

/// A kernel primitive that can dump its state and apply a restore script, both in its native
/// text syntax.
pub trait Kernel: Send + Sync {
    fn save(&self) -> Result<String, KernelError>;

    fn restore(&self, script: &str) -> Result<(), KernelError>;
}

/// Drives the `ipset` utility.
///
/// Restores run with `-exist` so that creating an existing set, adding a present member, or
/// removing an absent member is not an error. Restores are not atomic: lines before a failing line
/// remain applied.
#[derive(Clone, Debug)]
pub struct Ipset {
    path: PathBuf,
}

/// Drives `iptables-save`/`iptables-restore` on the filter table.
///
/// Restores run with `--noflush`, so only the chains a script declares are flushed, and are
/// applied atomically at `COMMIT`.
#[derive(Clone, Debug)]
pub struct Iptables {
    save: PathBuf,
    restore: PathBuf,
}

fn run(mut cmd: Command, stdin: Option<&str>) -> Result<String, KernelError> {
    trace!(?cmd, "Running");
    let mut child = cmd
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| KernelError::from_output(format!("failed to spawn {cmd:?}: {error}")))?;

    if let (Some(script), Some(mut input)) = (stdin, child.stdin.take()) {
        input
            .write_all(script.as_bytes())
            .map_err(|error| KernelError::from_output(format!("failed to write script: {error}")))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|error| KernelError::from_output(format!("failed to wait for {cmd:?}: {error}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, %stderr, "Command failed");
        return Err(KernelError::from_output(stderr));
    }

    String::from_utf8(output.stdout)
        .map_err(|error| KernelError::from_output(format!("invalid output: {error}")))
}

// === impl Ipset ===

impl Ipset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for Ipset {
    fn default() -> Self {
        Self::new("ipset")
    }
}

impl Kernel for Ipset {
    fn save(&self) -> Result<String, KernelError> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("save");
        run(cmd, None)
    }

    fn restore(&self, script: &str) -> Result<(), KernelError> {
        let mut cmd = Command::new(&self.path);
        cmd.args(["-exist", "restore"]);
        run(cmd, Some(script)).map(drop)
    }
}

// === impl Iptables ===

impl Iptables {
    pub fn new(save: impl Into<PathBuf>, restore: impl Into<PathBuf>) -> Self {
        Self {
            save: save.into(),
            restore: restore.into(),
        }
    }
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("iptables-save", "iptables-restore")
    }
}

impl Kernel for Iptables {
    fn save(&self) -> Result<String, KernelError> {
        let mut cmd = Command::new(&self.save);
        cmd.args(["-t", "filter"]);
        run(cmd, None)
    }

    fn restore(&self, script: &str) -> Result<(), KernelError> {
        let mut cmd = Command::new(&self.restore);
        cmd.args(["-w", "--noflush"]);
        run(cmd, Some(script)).map(drop)
    }
}
