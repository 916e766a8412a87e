use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use super::CancelLevel;
use crate::engines::StepCommand;

/// Result of one subprocess execution.
#[derive(Debug)]
pub struct CommandResult {
    pub exit_code: i32,
    /// True if a cooperative interrupt or a forced termination was
    /// delivered while the subprocess was running.
    pub interrupted: bool,
}

/// Run one step subprocess: capture stdout/stderr line-wise into per-step
/// log files, optionally tee stdout into a file for postprocess, and react
/// to the cancellation ladder (soft interrupt at level 2, forced
/// termination at level 3).
pub async fn run_command(
    command: &StepCommand,
    extra_env: &BTreeMap<String, String>,
    log_dir: &Path,
    attempt: u32,
    cancel: &mut watch::Receiver<CancelLevel>,
) -> Result<CommandResult> {
    debug!(
        name = %command.name,
        args = ?command.args,
        cwd = %command.cwd.display(),
        "Executing subprocess"
    );
    let (program, args) = command
        .args
        .split_first()
        .context("A step command must have at least a program name")?;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(&command.cwd)
        .envs(&command.env)
        .envs(extra_env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn subprocess '{}'", command.name))?;
    let pid = child.id();

    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();
    let stdout_handle = tokio::spawn(collect_lines(stdout));
    let stderr_handle = tokio::spawn(collect_lines(stderr));

    let mut soft_stopped = false;
    let mut hard_stopped = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            changed = cancel.changed() => {
                if changed.is_err() {
                    // No more cancellation signals can arrive.
                    break child.wait().await?;
                }
                let level = *cancel.borrow();
                if level >= CancelLevel::Interrupt && !soft_stopped {
                    send_signal(pid, Signal::Interrupt);
                    soft_stopped = true;
                }
                if level >= CancelLevel::Kill && !hard_stopped {
                    send_signal(pid, Signal::Terminate);
                    hard_stopped = true;
                }
            }
        }
    };

    let stdout_lines = stdout_handle.await?;
    let stderr_lines = stderr_handle.await?;

    write_log(log_dir, "stdout.log", &command.name, attempt, &stdout_lines)?;
    write_log(log_dir, "stderr.log", &command.name, attempt, &stderr_lines)?;
    if let Some(stdout_file) = &command.stdout_file {
        std::fs::write(stdout_file, stdout_lines.join("\n"))
            .with_context(|| format!("Failed to write {}", stdout_file.display()))?;
    }

    Ok(CommandResult {
        exit_code: status.code().unwrap_or(-1),
        interrupted: soft_stopped || hard_stopped,
    })
}

async fn collect_lines(stream: impl tokio::io::AsyncRead + Unpin) -> Vec<String> {
    let mut lines = Vec::new();
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        lines.push(line);
    }
    lines
}

/// Append subprocess output to the step's log file with an attempt header.
fn write_log(
    log_dir: &Path,
    filename: &str,
    command_name: &str,
    attempt: u32,
    lines: &[String],
) -> Result<()> {
    use std::io::Write;
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(filename);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "################################")?;
    writeln!(file, "# Subprocess '{}' - Attempt #{}", command_name, attempt)?;
    writeln!(file, "################################")?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

enum Signal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let signal = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _signal: Signal) {}
