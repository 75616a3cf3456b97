//! Child processes with a wall-clock timeout and bounded captured output.
//!
//! Used for quality-gate commands and `command` worker backends. Both are
//! blocking calls; async callers run them on the blocking thread pool.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout and stderr as lossy text, each followed by a truncation notice
    /// when bytes were dropped.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// Build a `Command` from an argv vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// `stdin` is fed from its own thread while stdout and stderr are drained
/// concurrently, so a child may interleave reading and writing freely. At
/// most `output_limit_bytes` of each stream is kept; the rest is counted.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(|e| {
        error!(err = %e, "failed to spawn command");
        anyhow::Error::new(e).context("spawn command")
    })?;

    let stdout = drain(child.stdout.take(), "stdout", output_limit_bytes)?;
    let stderr = drain(child.stderr.take(), "stderr", output_limit_bytes)?;
    let feeder = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // Dropping `pipe` at the end signals EOF. A child that exits
                // without reading yields a broken pipe; its exit status decides.
                if let Err(e) = pipe.write_all(&input) {
                    warn!(err = %e, "child did not consume stdin");
                }
            }))
        }
        (Some(_), None) => return Err(anyhow!("stdin was not piped")),
        (None, _) => None,
    };

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    if let Some(feeder) = feeder
        && feeder.join().is_err()
    {
        warn!("stdin feeder thread panicked");
    }
    let (stdout, stdout_truncated) = collect(stdout).context("join stdout")?;
    let (stderr, stderr_truncated) = collect(stderr).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type Drained = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>, name: &str, limit: usize) -> Result<Drained> {
    let pipe = pipe.ok_or_else(|| anyhow!("{name} was not piped"))?;
    Ok(thread::spawn(move || read_stream_limited(pipe, limit)))
}

fn collect(handle: Drained) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
