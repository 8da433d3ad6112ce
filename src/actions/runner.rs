use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct CommandRun {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandRun {
    pub fn ok(&self) -> bool {
        self.status.success() && !self.timed_out
    }
}

/// Runs `command` through `sh -lc`, appending stdout and stderr to `log`.
/// The child is killed once `timeout` elapses.
pub(crate) fn run_logged(
    command: &str,
    workdir: Option<&Path>,
    env: &[(&str, String)],
    log: &Path,
    timeout: Duration,
) -> Result<CommandRun> {
    let stdout = File::options()
        .create(true)
        .append(true)
        .open(log)
        .with_context(|| format!("open job log {}", log.display()))?;
    let stderr = stdout
        .try_clone()
        .with_context(|| format!("clone job log handle {}", log.display()))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-lc")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn `sh -lc {command}`"))?;

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            let _ = child.kill();
            break child.wait()?;
        }
        thread::sleep(Duration::from_millis(100));
    };

    Ok(CommandRun {
        status,
        timed_out,
        elapsed: start.elapsed(),
    })
}
