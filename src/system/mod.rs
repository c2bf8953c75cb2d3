// src/system/mod.rs

//! Subprocess execution under resource limits
//!
//! Runs external helpers (nbdkit and the qemu-img run command it spawns)
//! with CPU and address-space rlimits applied in the child, a wall-clock
//! timeout, and line-by-line forwarding of process output to a
//! caller-supplied callback. One invocation per call; retries belong to the
//! caller.

use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Default wall-clock cap for a single conversion run.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How much captured output to keep in an error message.
const OUTPUT_TAIL_LEN: usize = 512;

/// Resource limits applied to a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessLimits {
    /// CPU seconds (RLIMIT_CPU); 0 leaves the limit untouched.
    pub cpu_time_secs: u64,
    /// Address space bytes (RLIMIT_AS); 0 leaves the limit untouched.
    pub address_space_bytes: u64,
    /// Wall-clock cap on the whole run.
    pub timeout: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            cpu_time_secs: 0,
            address_space_bytes: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Run `command` with `args`, streaming each output line to `on_output`.
///
/// stdin is nulled to prevent hangs; stdout and stderr are drained
/// concurrently while the parent waits with a timeout. Returns the combined
/// output on exit 0. A non-zero exit, launch failure, or timeout yields
/// `Error::ProcessFailed`.
pub fn exec_with_limits<F>(
    limits: Option<&ProcessLimits>,
    on_output: F,
    command: &str,
    args: &[String],
) -> Result<Vec<u8>>
where
    F: Fn(&str) + Send + Sync,
{
    debug!("Executing {} {:?}", command, args);

    let (cpu_time, address_space) = limits
        .map(|l| (l.cpu_time_secs, l.address_space_bytes))
        .unwrap_or((0, 0));
    let timeout = limits.map(|l| l.timeout).unwrap_or(DEFAULT_TIMEOUT);

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        // Runs between fork and exec: must stay async-signal-safe, so no
        // allocation and no logging in here.
        cmd.pre_exec(move || {
            set_rlimit(libc::RLIMIT_CPU, cpu_time);
            set_rlimit(libc::RLIMIT_AS, address_space);
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| Error::ProcessFailed {
        command: command.to_string(),
        detail: format!("failed to spawn: {e}"),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let output = Mutex::new(Vec::new());

    let status = std::thread::scope(|scope| {
        if let Some(stdout) = stdout {
            scope.spawn(|| drain_lines(stdout, &on_output, &output));
        }
        if let Some(stderr) = stderr {
            scope.spawn(|| drain_lines(stderr, &on_output, &output));
        }

        let status = child.wait_timeout(timeout);
        if let Ok(None) = status {
            // Timed out: kill so the drain threads see EOF and the scope can
            // join them.
            let _ = child.kill();
            let _ = child.wait();
        }
        status
    })
    .map_err(|e| Error::ProcessFailed {
        command: command.to_string(),
        detail: format!("wait failed: {e}"),
    })?;

    let output = output.into_inner().unwrap();
    match status {
        None => Err(Error::ProcessFailed {
            command: command.to_string(),
            detail: format!("timed out after {}s", timeout.as_secs()),
        }),
        Some(status) if status.success() => Ok(output),
        Some(status) => {
            let code = status.code().unwrap_or(-1);
            warn!("{} exited with code {}", command, code);
            Err(Error::ProcessFailed {
                command: command.to_string(),
                detail: format!("exit code {}: {}", code, output_tail(&output)),
            })
        }
    }
}

/// Forward process output line by line, splitting on both LF and CR so the
/// converter's `\r`-terminated progress updates come through as they happen.
fn drain_lines<R, F>(reader: R, on_output: &F, sink: &Mutex<Vec<u8>>)
where
    R: Read,
    F: Fn(&str) + Send + Sync,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        let chunk = match reader.fill_buf() {
            Ok([]) => break,
            Ok(chunk) => chunk.to_vec(),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        reader.consume(chunk.len());
        sink.lock().unwrap().extend_from_slice(&chunk);
        for &byte in &chunk {
            if byte == b'\n' || byte == b'\r' {
                if !line.is_empty() {
                    on_output(&String::from_utf8_lossy(&line));
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
    }
    if !line.is_empty() {
        on_output(&String::from_utf8_lossy(&line));
    }
}

/// Set a resource limit if the value is non-zero.
///
/// Called between fork and exec; failures are ignored because nothing here
/// may allocate or log.
fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) {
    if value > 0 {
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        unsafe {
            libc::setrlimit(resource, &limit);
        }
    }
}

/// Last portion of the captured output, for error messages.
fn output_tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let trimmed = text.trim_end();
    if trimmed.len() <= OUTPUT_TAIL_LEN {
        return trimmed.to_string();
    }
    let mut cut = trimmed.len() - OUTPUT_TAIL_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &trimmed[cut..])
}
