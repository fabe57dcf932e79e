//! Local process host.
//!
//! Commands run as child processes of the orchestrator through a configured
//! shell. When a network namespace is configured (the emulated-topology case)
//! every command is wrapped in `sudo ip netns exec <ns>`, so the host behaves
//! like a separate machine sharing the local filesystem.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | Network namespace (optional) |
//! | Command timeout | None (bounded by the test itself) |
//! | Background commands | Child process + output relays |
//!
//! # Example Configuration
//!
//! ```toml
//! [topology]
//! type = "local"
//!
//! [topology.client]
//! name = "h1"
//! namespace = "h1"
//! storage_root = "/opt/mptcp-bench"
//!
//! [topology.server]
//! name = "h2"
//! namespace = "h2"
//! storage_root = "/opt/mptcp-bench"
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ChildReaper, ExecutorHandle, Host, HostError, HostResult, ProcessControl, check_exit};
use crate::config::LocalHostConfig;

/// Host whose commands run as local child processes.
pub struct LocalHost {
    name: String,
    shell: String,
    namespace: Option<String>,
    storage_root: PathBuf,
    env: Vec<(String, String)>,
}

impl LocalHost {
    /// Creates a local host from its configuration.
    ///
    /// Without an explicit `storage_root` the current directory is used.
    pub fn new(config: LocalHostConfig) -> Self {
        let storage_root = config
            .storage_root
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Self {
            name: config.name,
            shell: config.shell,
            namespace: config.namespace,
            storage_root,
            env: config.env.into_iter().collect(),
        }
    }

    fn command(&self, cmd: &str) -> tokio::process::Command {
        let mut process = match &self.namespace {
            Some(ns) => {
                let mut p = tokio::process::Command::new("sudo");
                p.args(["ip", "netns", "exec", ns.as_str(), self.shell.as_str(), "-c", cmd]);
                p
            }
            None => {
                let mut p = tokio::process::Command::new(&self.shell);
                p.arg("-c").arg(cmd);
                p
            }
        };

        for (key, value) in &self.env {
            process.env(key, value);
        }

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process
    }

    fn transport(&self, reason: impl std::fmt::Display) -> HostError {
        HostError::Transport {
            host: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    async fn run_sync(&self, cmd: &str) -> HostResult<String> {
        debug!("Host {} executing command: {}", self.name, cmd);

        let output = self
            .command(cmd)
            .output()
            .await
            .map_err(|e| self.transport(format!("failed to spawn '{}': {}", cmd, e)))?;

        check_exit(
            cmd,
            output.status.code().unwrap_or(-1),
            &output.stdout,
            &output.stderr,
        )
    }

    async fn run_async(&self, cmd: &str) -> HostResult<ExecutorHandle> {
        debug!("Host {} executing command: {} [NON-BLOCKING]", self.name, cmd);

        // Own process group, so a kill reaches everything the command starts.
        let mut process = self.command(cmd);
        process.process_group(0);
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| self.transport(format!("failed to spawn '{}': {}", cmd, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| self.transport("process exited before its pid was known"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.transport("stderr not captured"))?;

        let control = LocalControl {
            reaper: ChildReaper::spawn(child, self.name.clone()),
            privileged: self.namespace.is_some(),
        };

        Ok(ExecutorHandle::spawn(
            self.name.clone(),
            pid,
            Box::new(control),
            stdout,
            stderr,
        ))
    }
}

const TERM_GRACE: Duration = Duration::from_secs(2);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Control over a local process group led by the spawned shell.
struct LocalControl {
    reaper: ChildReaper,
    /// Namespaced commands run under sudo and need a privileged kill.
    privileged: bool,
}

impl LocalControl {
    async fn signal_group(&self, pgid: u32, signal: &str) {
        let script = format!("kill -{} -{}", signal, pgid);
        let mut kill = if self.privileged {
            let mut p = tokio::process::Command::new("sudo");
            p.args(["sh", "-c", &script]);
            p
        } else {
            let mut p = tokio::process::Command::new("sh");
            p.args(["-c", &script]);
            p
        };

        match kill.stdout(Stdio::null()).stderr(Stdio::null()).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => debug!("'{}' exited with {}", script, status),
            Err(e) => debug!("failed to run '{}': {}", script, e),
        }
    }

    /// Polls until the group is gone. Returns `false` on timeout.
    async fn settle(&self, pgid: u32, limit: Duration) -> HostResult<bool> {
        let deadline = tokio::time::Instant::now() + limit;
        while group_alive(pgid)? {
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(true)
    }
}

#[async_trait]
impl ProcessControl for LocalControl {
    async fn terminate(&self, pgid: u32) -> HostResult<()> {
        if !group_alive(pgid)? {
            return Ok(());
        }

        self.signal_group(pgid, "TERM").await;
        if !self.settle(pgid, TERM_GRACE).await? {
            self.signal_group(pgid, "KILL").await;
            if !self.settle(pgid, KILL_TIMEOUT).await? {
                debug!("process group {} still alive after SIGKILL", pgid);
            }
        }

        if !self.reaper.kill(KILL_TIMEOUT).await {
            debug!("process {} was not reaped within {:?}", pgid, KILL_TIMEOUT);
        }
        Ok(())
    }

    async fn is_alive(&self, pgid: u32) -> HostResult<bool> {
        Ok(group_alive(pgid)?)
    }

    async fn wait(&self) -> HostResult<i32> {
        self.reaper.wait().await
    }
}

/// Whether any live (non-zombie) process belongs to process group `pgid`.
fn group_alive(pgid: u32) -> std::io::Result<bool> {
    for entry in std::fs::read_dir("/proc")? {
        let Ok(stat) = std::fs::read_to_string(entry?.path().join("stat")) else {
            continue;
        };
        if let Some((state, group)) = parse_stat(&stat)
            && group == pgid
            && !matches!(state, 'Z' | 'X')
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Extracts (state, pgrp) from a `/proc/<pid>/stat` line.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> LocalHost {
        LocalHost::new(LocalHostConfig {
            name: "local-test".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_run_sync_returns_stdout() {
        let out = host().run_sync("echo hello").await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_run_sync_nonzero_exit_is_command_error() {
        let err = host()
            .run_sync("echo 'is not currently loaded' >&2; exit 3")
            .await
            .unwrap_err();

        match err {
            HostError::CommandExecution {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "is not currently loaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_in_changes_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = host().run_in("pwd", Some(dir.path())).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(&out).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_run_async_kill_stops_process() {
        let handle = host().run_async("sleep 30").await.unwrap();
        assert!(handle.is_running().await.unwrap());

        handle.kill().await.unwrap();
        assert!(!handle.is_running().await.unwrap());

        // Second kill is a no-op.
        handle.kill().await.unwrap();
    }

    fn process_alive(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| parse_stat(&stat))
            .is_some_and(|(state, _)| !matches!(state, 'Z' | 'X'))
    }

    #[test]
    fn test_parse_stat_handles_spaces_in_name() {
        let stat = "4242 (my (odd) cmd) S 1 4240 4240 0 -1 4194560 100 0 0 0";
        assert_eq!(parse_stat(stat), Some(('S', 4240)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_kill_stops_every_process_of_a_compound_command() {
        let handle = host().run_async("sleep 300 & echo $!; wait").await.unwrap();

        let inner: u32 = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(line) = handle.stdout().await.lines().next() {
                    return line.trim().parse::<u32>().unwrap();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(process_alive(inner));

        handle.kill().await.unwrap();
        assert!(!process_alive(inner));
        assert!(!handle.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_kill_while_another_task_waits() {
        let handle = std::sync::Arc::new(host().run_async("sleep 300").await.unwrap());
        let waiter = tokio::spawn({
            let handle = std::sync::Arc::clone(&handle);
            async move { handle.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(10), handle.kill())
            .await
            .expect("kill must not wait for natural exit")
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, -1);
    }

    #[tokio::test]
    async fn test_run_async_wait_collects_output() {
        let handle = host()
            .run_async("echo out; echo err >&2; exit 4")
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap(), 4);
        assert_eq!(handle.stdout().await, "out\n");
        assert_eq!(handle.stderr().await, "err\n");
        assert!(!handle.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_env_is_applied() {
        let mut config = LocalHostConfig {
            name: "env".to_string(),
            ..Default::default()
        };
        config.env.insert("BENCH_VAR".to_string(), "42".to_string());
        let out = LocalHost::new(config).run_sync("echo $BENCH_VAR").await.unwrap();
        assert_eq!(out, "42");
    }
}
