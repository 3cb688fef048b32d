use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One change applied to the child's environment on top of the inherited one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvOverride {
    Set(String, OsString),
    Remove(String),
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub max_capture_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: None,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    /// `None` when the child was killed by a signal or by the timeout.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 32);
        text.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            text.push('\n');
        }
        text.push_str(&self.stderr);
        if self.timed_out {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[...timed out...]\n");
        }
        text
    }
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or its output streams
/// cannot be read. A non-zero exit or a timeout is reported in [`RunOutput`].
pub fn run_command(
    program: &Path,
    args: &[OsString],
    envs: &[EnvOverride],
    options: &RunOptions,
) -> Result<RunOutput> {
    let mut command = configured_command(program, args, envs, options.cwd.as_deref());
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    // Grandchildren inherit the pipes; a timeout has to reach them too.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    debug!(program = %program.display(), ?args, "spawning");

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("stdout missing for {}", program.display()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("stderr missing for {}", program.display()))?;
    let limit = options.max_capture_bytes;
    let stdout_handle = thread::spawn(move || read_to_string_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_to_string_limited(stderr, limit));

    let (status, timed_out) = wait_with_timeout(&mut child, options.timeout, Kill::Group)
        .with_context(|| format!("failed to wait for {}", program.display()))?;
    let (mut stdout, stdout_truncated) = stdout_handle
        .join()
        .map_err(|_| anyhow::anyhow!("stdout thread panicked"))??;
    let (mut stderr, stderr_truncated) = stderr_handle
        .join()
        .map_err(|_| anyhow::anyhow!("stderr thread panicked"))??;
    if stdout_truncated {
        stdout.push_str("\n[...truncated...]\n");
    }
    if stderr_truncated {
        stderr.push_str("\n[...truncated...]\n");
    }
    let code = if timed_out { None } else { status.code() };
    debug!(program = %program.display(), ?code, timed_out, "finished");
    Ok(RunOutput {
        code,
        stdout,
        stderr,
        timed_out,
    })
}

/// Execute a program with inherited stdio, returning its exit code.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned.
pub fn run_command_passthrough(
    program: &Path,
    args: &[OsString],
    envs: &[EnvOverride],
    options: &RunOptions,
) -> Result<Option<i32>> {
    let mut command = configured_command(program, args, envs, options.cwd.as_deref());
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
    debug!(program = %program.display(), ?args, "spawning (passthrough)");

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;
    let (status, timed_out) = wait_with_timeout(&mut child, options.timeout, Kill::Child)
        .with_context(|| format!("failed to wait for {}", program.display()))?;
    Ok(if timed_out { None } else { status.code() })
}

fn configured_command(
    program: &Path,
    args: &[OsString],
    envs: &[EnvOverride],
    cwd: Option<&Path>,
) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    for env in envs {
        match env {
            EnvOverride::Set(key, value) => {
                command.env(key, value);
            }
            EnvOverride::Remove(key) => {
                command.env_remove(key);
            }
        }
    }
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command
}

/// What a timeout kills. Passthrough children stay in the caller's process
/// group so they keep the terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kill {
    Child,
    Group,
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    kill: Kill,
) -> Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait()?, false));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if Instant::now() >= deadline {
            if kill == Kill::Group {
                kill_process_group(child);
            }
            // The child may exit between try_wait and kill.
            let _ = child.kill();
            return Ok((child.wait()?, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let group = Pid::from_raw(child.id() as i32);
    if let Err(err) = killpg(group, Signal::SIGKILL) {
        debug!(pid = child.id(), %err, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn read_to_string_limited(mut reader: impl Read, limit: usize) -> Result<(String, bool)> {
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        append_limited(&mut buffer, &chunk[..read], limit, &mut truncated);
    }
    Ok((String::from_utf8_lossy(&buffer).to_string(), truncated))
}

// Keeps the tail: the end of a failing build log is the useful part.
fn append_limited(buffer: &mut Vec<u8>, chunk: &[u8], limit: usize, truncated: &mut bool) {
    if limit == 0 {
        return;
    }
    if buffer.len().saturating_add(chunk.len()) <= limit {
        buffer.extend_from_slice(chunk);
        return;
    }
    *truncated = true;
    let old_len = buffer.len();
    let excess = old_len.saturating_add(chunk.len()).saturating_sub(limit);
    if excess >= old_len {
        buffer.clear();
        let drop_from_chunk = excess.saturating_sub(old_len).min(chunk.len());
        buffer.extend_from_slice(&chunk[drop_from_chunk..]);
    } else {
        buffer.drain(0..excess);
        buffer.extend_from_slice(chunk);
    }
}
