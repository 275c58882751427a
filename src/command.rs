//! Single surface for locating and running external tools.
//!
//! Every subprocess the orchestrator starts goes through a [`CommandRunner`],
//! so tests can substitute a stub and so every child is bound to the caller's
//! [`RunContext`].
use crate::context::{ContextError, RunContext};
use anyhow::{Context, Result};
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
/// How long output pipes may stay open after the child itself has exited.
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Subprocess failures the orchestrator needs to classify.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{tool}: command not found")]
    NotFound { tool: String },
    #[error("{tool} exited with {}", exit_label(.code))]
    Exit { tool: String, code: Option<i32> },
    #[error("{tool} interrupted: {cause}")]
    Interrupted { tool: String, cause: ContextError },
    #[error("{tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn tool(&self) -> &str {
        match self {
            CommandError::NotFound { tool }
            | CommandError::Exit { tool, .. }
            | CommandError::Interrupted { tool, .. }
            | CommandError::Io { tool, .. } => tool,
        }
    }

    /// Exit code of a completed process, when there is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Exit { code, .. } => *code,
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

/// Destination for subprocess output; shared across the tee threads.
pub type Log = dyn Write + Send;

/// Process lookup, run, and capture.
///
/// `run` and `capture` fail immediately with the context error if `ctx` is
/// already done. Errors carry the tool name.
pub trait CommandRunner: Send + Sync {
    /// Locate an executable on `PATH`.
    fn lookup(&self, name: &str) -> Result<PathBuf>;

    /// Run to completion, streaming stdout and stderr to `log`.
    fn run(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        name: &str,
        args: &[String],
    ) -> Result<()>;

    /// Like [`CommandRunner::run`] but return stdout; stderr still goes to `log`.
    fn capture(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        name: &str,
        args: &[String],
    ) -> Result<String>;
}

/// Default runner backed by real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommands;

impl CommandRunner for SystemCommands {
    fn lookup(&self, name: &str) -> Result<PathBuf> {
        which::which(name).map_err(|_| {
            CommandError::NotFound {
                tool: name.to_string(),
            }
            .into()
        })
    }

    fn run(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        name: &str,
        args: &[String],
    ) -> Result<()> {
        execute(ctx, dir, log, name, args, false).map(|_| ())
    }

    fn capture(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        name: &str,
        args: &[String],
    ) -> Result<String> {
        let stdout = execute(ctx, dir, log, name, args, true)?;
        String::from_utf8(stdout).with_context(|| format!("decode {name} stdout as UTF-8"))
    }
}

/// Render a command line for logs.
pub fn display_command(name: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(name);
    parts.extend(args.iter().map(String::as_str));
    shell_words::join(parts)
}

/// Convenience for building owned argument lists.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn execute(
    ctx: &RunContext,
    dir: &Path,
    log: &mut Log,
    name: &str,
    args: &[String],
    capture_stdout: bool,
) -> Result<Vec<u8>> {
    if let Some(cause) = ctx.err() {
        return Err(cause.into());
    }
    let _ = writeln!(log, "$ {}", display_command(name, args));

    let mut cmd = Command::new(name);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|err| spawn_error(name, err))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let log = Mutex::new(log);
    let stop = AtomicBool::new(false);
    let (status, cut, captured) = std::thread::scope(|scope| {
        let log = &log;
        let stop = &stop;
        let out_handle = scope.spawn(move || {
            let mut captured = Vec::new();
            if let Some(stream) = stdout {
                pump(stream, log, capture_stdout.then_some(&mut captured), stop);
            }
            captured
        });
        let err_handle = scope.spawn(move || {
            if let Some(stream) = stderr {
                pump(stream, log, None, stop);
            }
        });
        let status = supervise(ctx, &mut child, name);
        let cut = drain_pipes(ctx, stop, || {
            out_handle.is_finished() && err_handle.is_finished()
        });
        let captured = out_handle.join().unwrap_or_default();
        let _ = err_handle.join();
        (status, cut, captured)
    });
    let status = status?;
    if let Some(cause) = cut {
        tracing::warn!(tool = name, "output pipes still open when the context ended");
        return Err(CommandError::Interrupted {
            tool: name.to_string(),
            cause,
        }
        .into());
    }

    tracing::debug!(
        tool = name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        code = status.code(),
        "command finished"
    );
    if !status.success() {
        return Err(CommandError::Exit {
            tool: name.to_string(),
            code: status.code(),
        }
        .into());
    }
    Ok(captured)
}

fn spawn_error(name: &str, err: std::io::Error) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        return CommandError::NotFound {
            tool: name.to_string(),
        }
        .into();
    }
    CommandError::Io {
        tool: name.to_string(),
        source: err,
    }
    .into()
}

/// Wait for the tee threads once the child has exited. A detached
/// grandchild can hold the pipes open indefinitely, so reading stops after
/// [`PIPE_GRACE`] or as soon as `ctx` ends; the latter is returned.
fn drain_pipes(
    ctx: &RunContext,
    stop: &AtomicBool,
    finished: impl Fn() -> bool,
) -> Option<ContextError> {
    let grace_end = Instant::now() + PIPE_GRACE;
    while !finished() {
        if let Some(cause) = ctx.err() {
            stop.store(true, Ordering::Relaxed);
            return Some(cause);
        }
        if Instant::now() >= grace_end {
            tracing::debug!("output pipes held open past exit; detaching");
            stop.store(true, Ordering::Relaxed);
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    None
}

/// A pipe that can report readiness without blocking past one poll interval.
trait PollRead: Read {
    /// True when a read will not block (data or EOF).
    fn wait_readable(&self) -> bool;
}

#[cfg(unix)]
impl<T: Read + std::os::fd::AsRawFd> PollRead for T {
    fn wait_readable(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = libc::c_int::try_from(POLL_INTERVAL.as_millis()).unwrap_or(25);
        // SAFETY: `pfd` is a single valid pollfd that outlives the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout) };
        ready > 0
    }
}

#[cfg(not(unix))]
impl<T: Read> PollRead for T {
    fn wait_readable(&self) -> bool {
        true
    }
}

fn pump<R: PollRead>(
    mut stream: R,
    log: &Mutex<&mut Log>,
    mut capture: Option<&mut Vec<u8>>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 8192];
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if !stream.wait_readable() {
            continue;
        }
        let read = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        let chunk = &buf[..read];
        match capture.as_deref_mut() {
            Some(captured) => captured.extend_from_slice(chunk),
            None => {
                if let Ok(mut log) = log.lock() {
                    let _ = log.write_all(chunk);
                }
            }
        }
    }
}

fn supervise(ctx: &RunContext, child: &mut Child, name: &str) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("wait for {name}"))?
        {
            return Ok(status);
        }
        if let Some(cause) = ctx.err() {
            terminate(child);
            return Err(CommandError::Interrupted {
                tool: name.to_string(),
                cause,
            }
            .into());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM, then SIGKILL once the grace period lapses.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            // SAFETY: signalling the process group of a child we spawned and
            // have not yet reaped.
            unsafe {
                libc::kill(-pid, libc::SIGTERM);
            }
            let start = Instant::now();
            while start.elapsed() < TERMINATE_GRACE {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            // SAFETY: as above.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// True when `path` is a file the current platform would execute.
///
/// POSIX requires at least one execute bit; elsewhere existence is enough.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
