use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, Cancelled};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an external command to completion. Injected so backends can be
/// exercised without spawning real installers.
pub type CommandRunner = dyn Fn(&mut Command, &str, &CancelToken) -> Result<()> + Send + Sync;

/// Spawns `command` and polls it, killing the child when `cancel` trips.
/// Failures carry the exit status and captured output.
pub fn run_command(command: &mut Command, context_message: &str, cancel: &CancelToken) -> Result<()> {
    cancel.check(context_message)?;
    debug!(command = ?command, "spawning");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("{context_message}: command failed to start"))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if cancel.is_cancelled() {
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to kill cancelled command");
            }
            let _ = child.wait();
            return Err(Cancelled {
                step: context_message.to_string(),
            }
            .into());
        }
        match child
            .try_wait()
            .with_context(|| format!("{context_message}: failed to poll command"))?
        {
            Some(status) => break status,
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let stdout = stdout.map(join_drain).unwrap_or_default();
    let stderr = stderr.map(join_drain).unwrap_or_default();
    if status.success() {
        return Ok(());
    }

    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        status,
        stdout.trim(),
        stderr.trim()
    ))
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut raw = Vec::new();
        let _ = pipe.read_to_end(&mut raw);
        String::from_utf8_lossy(&raw).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

pub(crate) fn escape_ps_single_quote(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}
