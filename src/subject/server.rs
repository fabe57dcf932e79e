//! Transfer server lifecycle.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{SubjectConfig, TestConfig};
use crate::host::{ExecutorHandle, Host};
use crate::resource::Scoped;
use crate::resource::catalog::ServerProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Everything needed to build the server command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerLaunch {
    profile: ServerProfile,
    subject: SubjectConfig,
    port: Option<u16>,
    debug: bool,
    continue_train: Option<i64>,
}

impl ServerLaunch {
    /// Plain servers take `server_debug` from the test section; learning
    /// servers read `server_debug` and `continue_train` from scheduler params.
    pub fn new(
        profile: ServerProfile,
        test: &TestConfig,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let (debug, continue_train) = if profile.learning {
            (
                params.get("server_debug").is_some_and(truthy),
                params.get("continue_train").and_then(as_int).filter(|n| *n != 0),
            )
        } else {
            (test.server_debug, None)
        };

        Self {
            profile,
            subject: test.subject.clone(),
            port: test.server_port,
            debug,
            continue_train,
        }
    }

    fn native_binary(&self) -> Option<&str> {
        match &self.subject {
            SubjectConfig::Native { binary } if !self.profile.learning => Some(binary),
            _ => None,
        }
    }

    pub fn command(&self, storage_root: &Path, ip: &str) -> String {
        let mut cmd = match self.native_binary() {
            Some(binary) => format!("sudo mptcpize run {} payload serve --ip {}", binary, ip),
            None => {
                let script = storage_root
                    .join("servers")
                    .join("payload")
                    .join(self.profile.payload_dir)
                    .join(self.profile.script);
                let prefix = if self.profile.mptcpize {
                    "sudo mptcpize run "
                } else {
                    ""
                };
                format!("{}python3 {} --ip {}", prefix, script.display(), ip)
            }
        };

        if let Some(port) = self.port {
            cmd.push_str(&format!(" --port {}", port));
        }
        if self.debug && self.native_binary().is_none() {
            cmd.push_str(" --debug");
        }
        if let Some(n) = self.continue_train {
            cmd.push_str(&format!(" --continue_train {}", n));
        }
        cmd
    }

    /// Sweeps stale server instances left by earlier runs.
    pub fn killall_command(&self) -> String {
        match self.native_binary() {
            Some(_) => r#"sudo pkill -f ".*payload serve.*""#.to_string(),
            None => r#"sudo pkill -f ".*server_payload.py.*""#.to_string(),
        }
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

fn as_int(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Bool(b) => Some(i64::from(*b)),
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// A test server bound to one host for one transfer.
pub struct TestServer<'h, H: Host + ?Sized> {
    host: &'h H,
    launch: ServerLaunch,
    handle: Option<ExecutorHandle>,
    state: ServerState,
}

impl<'h, H: Host + ?Sized> TestServer<'h, H> {
    pub fn new(host: &'h H, launch: ServerLaunch) -> Self {
        Self {
            host,
            launch,
            handle: None,
            state: ServerState::Stopped,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    async fn killall(&self) {
        let cmd = self.launch.killall_command();
        debug!("Killing all server instances on {}", self.host.name());
        if let Err(e) = self.host.run_sync(&cmd).await {
            warn!("Error encountered in killall: {}", e);
        }
    }
}

#[async_trait]
impl<'h, H: Host + ?Sized> Scoped for TestServer<'h, H> {
    async fn enter(&mut self) -> Result<()> {
        self.state = ServerState::Starting;
        self.killall().await;

        let ip = self.host.primary_ip().await?;
        let cmd = self.launch.command(self.host.storage_root(), &ip);
        let handle = self
            .host
            .run_async(&cmd)
            .await
            .with_context(|| format!("Failed to start {} server", self.launch.profile.name))?;

        info!(
            "{} server started with PID: {}",
            self.launch.profile.name,
            handle.pid()
        );
        self.handle = Some(handle);

        tokio::time::sleep(self.launch.profile.settle).await;
        self.state = ServerState::Running;
        Ok(())
    }

    async fn exit(&mut self) {
        self.state = ServerState::Stopping;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.kill().await {
                warn!("Failed to stop server (pid {}): {}", handle.pid(), e);
            }
            info!("{} server stopped", self.launch.profile.name);
        }

        self.killall().await;
        self.state = ServerState::Stopped;
    }
}
