//! SSH host implementation.
//!
//! Commands run on a remote machine through the system `ssh` binary. All
//! invocations share one multiplexed OpenSSH connection (`ControlMaster`), so
//! the session is established once per host and reused for every command.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Session | Persistent, multiplexed via a control socket |
//! | Command timeout | Per synchronous command (`command_timeout_secs`) |
//! | Background commands | `echo $$; exec sh -c <cmd>`, the remote pid leads its process group |
//! | File transfer | Via `scp` |
//!
//! # Credentials
//!
//! Authentication to the host is key-based (`BatchMode=yes`). A configured
//! password is only used for privilege escalation: every `sudo ` in a command
//! becomes `echo <password> | sudo -S -E `. A configured virtualenv rewrites
//! `python3` to `<venv>/bin/python3`.
//!
//! # Example Configuration
//!
//! ```toml
//! [topology]
//! type = "ssh"
//!
//! [topology.server]
//! hostname = "10.0.0.2"
//! username = "bench"
//! password = "secret"
//! key_path = "~/.ssh/id_ed25519"
//! storage_root = "/tmp/mptcp-bench"
//! venv_path = "/tmp/mptcp-bench/.venv"
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{ChildReaper, ExecutorHandle, Host, HostError, HostResult, ProcessControl, check_exit};
use crate::config::SshHostConfig;

/// OpenSSH exits with 255 when the connection itself failed.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Substitutes privilege-escalation and interpreter tokens in a command.
pub fn apply_credentials(cmd: &str, password: Option<&str>, venv_path: Option<&str>) -> String {
    let mut command = cmd.to_string();

    if let Some(password) = password
        && command.contains("sudo ")
    {
        let replacement = format!("echo {} | sudo -S -E ", shell_words::quote(password));
        command = command.replace("sudo ", &replacement);
    }

    if let Some(venv) = venv_path {
        let interpreter = format!("{}/bin/python3", venv.trim_end_matches('/'));
        command = command.replace("python3", &interpreter);
    }

    command
}

/// Invocation details for one multiplexed SSH session.
#[derive(Clone)]
struct SshSession {
    host: String,
    destination: String,
    ssh_opts: Vec<String>,
    password: Option<String>,
    venv_path: Option<String>,
    command_timeout: Duration,
}

impl SshSession {
    fn ssh_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(&self.ssh_opts);
        cmd.arg(&self.destination);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn credentialize(&self, cmd: &str) -> String {
        apply_credentials(cmd, self.password.as_deref(), self.venv_path.as_deref())
    }

    /// Remote command line for a background command.
    ///
    /// The shell prints its pid and is replaced by `sh -c`, so that pid stays
    /// the leader of the process group every part of `cmd` runs in.
    fn background_command(&self, cmd: &str) -> String {
        format!(
            "echo $$; exec sh -c {}",
            shell_words::quote(&self.credentialize(cmd))
        )
    }

    fn transport(&self, reason: impl std::fmt::Display) -> HostError {
        HostError::Transport {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }

    /// Runs a command to completion under the transport deadline.
    ///
    /// Errors mention `display_cmd`, never the credentialized command, so
    /// passwords do not end up in logs.
    async fn run(&self, cmd: &str, display_cmd: &str) -> HostResult<String> {
        let remote = format!("bash -c {}", shell_words::quote(&self.credentialize(cmd)));

        let mut ssh = self.ssh_command();
        ssh.arg(&remote);
        ssh.kill_on_drop(true);

        let secs = self.command_timeout.as_secs();
        let output = tokio::time::timeout(self.command_timeout, ssh.output())
            .await
            .map_err(|_| HostError::Timeout {
                host: self.host.clone(),
                command: display_cmd.to_string(),
                secs,
            })?
            .map_err(|e| self.transport(format!("failed to spawn ssh: {}", e)))?;

        let code = output.status.code().unwrap_or(-1);
        if code == SSH_TRANSPORT_EXIT {
            return Err(self.transport(String::from_utf8_lossy(&output.stderr).trim()));
        }

        check_exit(display_cmd, code, &output.stdout, &output.stderr)
    }
}

/// Host reached over SSH.
pub struct SshHost {
    session: SshSession,
    scp_opts: Vec<String>,
    storage_root: PathBuf,
    control_path: PathBuf,
}

impl SshHost {
    /// Creates a host from its configuration.
    ///
    /// No connection is made here; the control master is started lazily by
    /// the first command.
    pub fn new(config: SshHostConfig) -> Self {
        let control_path = std::env::temp_dir().join(format!(
            "mptcp-bench-{}-{}-{}",
            std::process::id(),
            config.username,
            config.hostname
        ));

        let mut common = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
        ];

        if config.disable_host_key_check {
            common.push("-o".to_string());
            common.push("StrictHostKeyChecking=no".to_string());
            common.push("-o".to_string());
            common.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &config.key_path {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            common.push("-i".to_string());
            common.push(key);
        }

        let mut ssh_opts = common.clone();
        ssh_opts.push("-p".to_string());
        ssh_opts.push(config.port.to_string());

        let mut scp_opts = common;
        scp_opts.push("-P".to_string());
        scp_opts.push(config.port.to_string());

        Self {
            session: SshSession {
                host: config.hostname.clone(),
                destination: format!("{}@{}", config.username, config.hostname),
                ssh_opts,
                password: config.password,
                venv_path: config.venv_path,
                command_timeout: Duration::from_secs(config.command_timeout_secs),
            },
            scp_opts,
            storage_root: PathBuf::from(config.storage_root),
            control_path,
        }
    }

    /// Copies a local file or directory tree to the host.
    pub async fn upload(&self, local: &Path, remote: &Path) -> HostResult<()> {
        let remote_path = format!("{}:{}", self.session.destination, remote.display());

        let output = tokio::process::Command::new("scp")
            .arg("-r")
            .args(&self.scp_opts)
            .arg(local)
            .arg(&remote_path)
            .output()
            .await
            .map_err(|e| self.session.transport(format!("failed to spawn scp: {}", e)))?;

        if !output.status.success() {
            return Err(self
                .session
                .transport(String::from_utf8_lossy(&output.stderr).trim()));
        }

        Ok(())
    }

    /// Closes the multiplexed session. Safe to call when none is open.
    pub async fn close(&self) {
        let result = tokio::process::Command::new("ssh")
            .args(&self.session.ssh_opts)
            .args(["-O", "exit"])
            .arg(&self.session.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(_) => info!("Closed SSH session with {}", self.session.host),
            Err(e) => warn!("Failed to close SSH session with {}: {}", self.session.host, e),
        }
        if let Err(e) = std::fs::remove_file(&self.control_path) {
            debug!(
                "Control socket {} not removed: {}",
                self.control_path.display(),
                e
            );
        }
    }
}

#[async_trait]
impl Host for SshHost {
    fn name(&self) -> &str {
        &self.session.host
    }

    fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    async fn run_sync(&self, cmd: &str) -> HostResult<String> {
        debug!("Host {} executing command: {}", self.session.host, cmd);
        self.session.run(cmd, cmd).await
    }

    async fn run_async(&self, cmd: &str) -> HostResult<ExecutorHandle> {
        debug!(
            "Host {} executing command: {} [NON-BLOCKING]",
            self.session.host, cmd
        );

        let remote = self.session.background_command(cmd);
        let mut ssh = self.session.ssh_command();
        ssh.arg(&remote);
        ssh.kill_on_drop(true);

        let mut child = ssh
            .spawn()
            .map_err(|e| self.session.transport(format!("failed to spawn ssh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.session.transport("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.session.transport("stderr not captured"))?;

        // The first stdout line is the remote shell's pid, printed before exec.
        let mut stdout = BufReader::new(stdout);
        let mut first_line = String::new();
        let read = tokio::time::timeout(
            self.session.command_timeout,
            stdout.read_line(&mut first_line),
        )
        .await
        .map_err(|_| HostError::Timeout {
            host: self.session.host.clone(),
            command: cmd.to_string(),
            secs: self.session.command_timeout.as_secs(),
        })??;

        let pid: u32 = first_line.trim().parse().map_err(|_| {
            self.session.transport(format!(
                "expected remote pid, got {:?} ({} bytes)",
                first_line.trim(),
                read
            ))
        })?;

        let control = SshControl {
            session: self.session.clone(),
            reaper: ChildReaper::spawn(child, self.session.host.clone()),
        };

        Ok(ExecutorHandle::spawn(
            self.session.host.clone(),
            pid,
            Box::new(control),
            stdout,
            stderr,
        ))
    }
}

/// Control over a remote process group and the local `ssh` client carrying it.
struct SshControl {
    session: SshSession,
    reaper: ChildReaper,
}

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

fn group_kill_command(pgid: u32) -> String {
    format!("sudo kill -9 -- -{}", pgid)
}

fn group_alive_command(pgid: u32) -> String {
    format!("pgrep -g {}", pgid)
}

#[async_trait]
impl ProcessControl for SshControl {
    async fn terminate(&self, pgid: u32) -> HostResult<()> {
        let cmd = group_kill_command(pgid);
        if let Err(e) = self.session.run(&cmd, &cmd).await {
            debug!("Remote kill of group {} on {}: {}", pgid, self.session.host, e);
        }

        if !self.reaper.kill(REAP_TIMEOUT).await {
            debug!(
                "ssh client for {} on {} not reaped within {:?}",
                pgid, self.session.host, REAP_TIMEOUT
            );
        }
        Ok(())
    }

    async fn is_alive(&self, pgid: u32) -> HostResult<bool> {
        let cmd = group_alive_command(pgid);
        match self.session.run(&cmd, &cmd).await {
            Ok(output) => Ok(!output.trim().is_empty()),
            // pgrep exits 1 when nothing matched.
            Err(HostError::CommandExecution { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn wait(&self) -> HostResult<i32> {
        self.reaper.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SshHostConfig {
        SshHostConfig {
            hostname: "server.example".to_string(),
            username: "bench".to_string(),
            password: Some("pw".to_string()),
            key_path: Some(PathBuf::from("/keys/id")),
            port: 2222,
            storage_root: "/tmp/mptcp-bench".to_string(),
            venv_path: None,
            disable_host_key_check: true,
            command_timeout_secs: 60,
            upload_dirs: Vec::new(),
        }
    }

    #[test]
    fn test_apply_credentials_sudo() {
        let cmd = apply_credentials("sudo modprobe mptcp_ecf", Some("pw"), None);
        assert_eq!(cmd, "echo pw | sudo -S -E modprobe mptcp_ecf");
    }

    #[test]
    fn test_apply_credentials_quotes_password() {
        let cmd = apply_credentials("sudo true", Some("p w'd"), None);
        assert!(cmd.starts_with("echo 'p w'\\''d' | sudo -S -E "));
    }

    #[test]
    fn test_apply_credentials_venv() {
        let cmd = apply_credentials(
            "sudo mptcpize run python3 server.py",
            None,
            Some("/opt/venv/"),
        );
        assert_eq!(cmd, "sudo mptcpize run /opt/venv/bin/python3 server.py");
    }

    #[test]
    fn test_apply_credentials_untouched_without_tokens() {
        assert_eq!(apply_credentials("ls -la", Some("pw"), Some("/v")), "ls -la");
    }

    #[test]
    fn test_background_command_wraps_pipelines_in_one_shell() {
        let host = SshHost::new(config());
        let remote = host
            .session
            .background_command("sudo iperf3 -s -p 5201 | tee log");

        assert_eq!(
            remote,
            "echo $$; exec sh -c 'echo pw | sudo -S -E iperf3 -s -p 5201 | tee log'"
        );
    }

    #[test]
    fn test_group_commands_target_the_whole_group() {
        assert_eq!(group_kill_command(4242), "sudo kill -9 -- -4242");
        assert_eq!(group_alive_command(4242), "pgrep -g 4242");
    }

    #[test]
    fn test_new_builds_multiplexed_options() {
        let host = SshHost::new(config());
        let opts = &host.session.ssh_opts;

        assert!(opts.contains(&"ControlMaster=auto".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(opts.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(host.scp_opts.windows(2).any(|w| w[0] == "-P" && w[1] == "2222"));
        assert_eq!(host.session.destination, "bench@server.example");
        assert_eq!(host.name(), "server.example");
        assert_eq!(host.storage_root(), Path::new("/tmp/mptcp-bench"));
    }
}
