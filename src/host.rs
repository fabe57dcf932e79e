//! Host capability surface and execution backends.
//!
//! Every experiment step is expressed as shell commands issued against a
//! [`Host`]. The same driver code runs unchanged whether the host is a local
//! (optionally namespaced) process environment or a machine reached over SSH.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Host                               │
//! │                                                              │
//! │  run_sync(cmd)  ──────────► stdout | HostError              │
//! │  run_async(cmd) ──────────► ExecutorHandle                  │
//! │  list_interface_ips()                                        │
//! │  storage_root()                                              │
//! └────────────────────────────────┬────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutorHandle                          │
//! │  pid()  is_running()  wait()  kill()                         │
//! │  stdout relay task ──► tracing (INFO)                        │
//! │  stderr relay task ──► tracing (ERROR)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Backends
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | Local | [`local`] | Shell child processes, optionally inside a network namespace |
//! | SSH | [`ssh`] | Remote commands over a multiplexed OpenSSH session |
//!
//! # Error Handling
//!
//! All host operations return [`HostResult<T>`]. A command that ran and
//! exited non-zero is a [`HostError::CommandExecution`]; anything that kept
//! the command from running or reporting back is a transport failure
//! ([`HostError::Transport`] or [`HostError::Timeout`]). Callers decide which
//! command failures are benign, see [`crate::resource::BenignFailure`].

pub mod executor;
pub mod local;
pub mod ssh;

#[cfg(test)]
pub(crate) mod scripted;

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

pub use executor::{ChildReaper, ExecutorHandle, ProcessControl};

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur while executing commands on a host.
///
/// - **Command failures**: `CommandExecution` - the command ran and exited
///   non-zero; the captured output is kept for classification
/// - **Transport failures**: `Transport`, `Timeout` - the command could not be
///   delivered or its result could not be collected
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The command ran and returned a non-zero exit status.
    #[error("Command '{command}' failed with exit status {exit_code}.{}", failure_detail(.stdout, .stderr))]
    CommandExecution {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Connection lost, session unusable, or the process could not be spawned.
    #[error("Transport failure on {host}: {reason}")]
    Transport { host: String, reason: String },

    /// The transport-level deadline for a synchronous command elapsed.
    #[error("Command '{command}' on {host} timed out after {secs}s")]
    Timeout {
        host: String,
        command: String,
        secs: u64,
    },

    /// I/O error while talking to a local process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn failure_detail(stdout: &str, stderr: &str) -> String {
    let mut detail = String::new();
    if !stderr.is_empty() {
        detail.push_str(&format!(" Error: {}", stderr));
    }
    if !stdout.is_empty() {
        detail.push_str(&format!(" Output: {}", stdout));
    }
    detail
}

impl HostError {
    /// Returns `true` for failures of the execution layer itself rather than
    /// of the command that was run.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HostError::Transport { .. } | HostError::Timeout { .. } | HostError::Io(_)
        )
    }

    /// Captured stdout and stderr of a failed command, joined for matching.
    pub fn command_output(&self) -> Option<String> {
        match self {
            HostError::CommandExecution { stdout, stderr, .. } => {
                Some(format!("{}\n{}", stderr, stdout))
            }
            _ => None,
        }
    }
}

/// Builds the error for a finished command, or returns its trimmed stdout.
pub(crate) fn check_exit(
    command: &str,
    exit_code: i32,
    stdout: &[u8],
    stderr: &[u8],
) -> HostResult<String> {
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();

    if exit_code != 0 {
        return Err(HostError::CommandExecution {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
        });
    }

    Ok(stdout)
}

static INET_ADDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"inet\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid regex")
});

/// Extracts non-loopback IPv4 addresses from `ip -o addr show` output.
pub fn parse_interface_ips(output: &str) -> Vec<String> {
    INET_ADDR
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .filter(|ip| ip != "127.0.0.1")
        .collect()
}

/// A machine that experiment commands run on.
///
/// Hosts are supplied by the testbed and only borrowed by the experiment
/// core. Implementations must be shareable across tasks because background
/// commands relay their output from spawned tasks.
#[async_trait]
pub trait Host: Send + Sync {
    /// Human-readable host name used in logs.
    fn name(&self) -> &str;

    /// Directory on the host under which payloads and kernel sources live.
    fn storage_root(&self) -> &Path;

    /// Runs a command to completion and returns its trimmed stdout.
    ///
    /// # Errors
    ///
    /// - `HostError::CommandExecution` - the command exited non-zero
    /// - `HostError::Transport` / `HostError::Timeout` - delivery failed
    async fn run_sync(&self, cmd: &str) -> HostResult<String>;

    /// Launches a command in the background.
    ///
    /// Returns as soon as the process is running and its output relays are
    /// attached. The caller owns the returned handle and must `kill()` it.
    async fn run_async(&self, cmd: &str) -> HostResult<ExecutorHandle>;

    /// Runs a command from the given directory.
    async fn run_in(&self, cmd: &str, cwd: Option<&Path>) -> HostResult<String> {
        match cwd {
            Some(dir) => {
                let dir = shell_words::quote(&dir.to_string_lossy()).into_owned();
                self.run_sync(&format!("cd {} && {}", dir, cmd)).await
            }
            None => self.run_sync(cmd).await,
        }
    }

    /// Lists the host's IPv4 interface addresses, loopback excluded.
    async fn list_interface_ips(&self) -> HostResult<Vec<String>> {
        let output = self.run_sync("ip -o addr show").await?;
        Ok(parse_interface_ips(&output))
    }

    /// The address experiments bind to: the first interface address.
    async fn primary_ip(&self) -> HostResult<String> {
        self.list_interface_ips()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HostError::Transport {
                host: self.name().to_string(),
                reason: "host has no non-loopback IPv4 address".to_string(),
            })
    }
}
