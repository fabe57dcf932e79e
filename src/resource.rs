//! Scoped activation of schedulers and congestion controls.
//!
//! A [`ResourceController`] brings one kernel capability into effect on both
//! the client and the server host for the duration of a scope, then removes
//! it again:
//!
//! ```text
//!            enter()                          exit()
//! Unloaded ──load()──► Loaded ──activate()──► Active ──unload()──► Unloaded
//!    ▲                    │                                          │
//!    └────── unload() ◄───┘ (activate failed; exit still runs) ◄─────┘
//! ```
//!
//! Loading and removal tolerate a closed set of expected failures, see
//! [`BenignFailure`]. Activation failures are always fatal: a test run under
//! the previous scheduler would silently measure the wrong thing.
//!
//! Scopes are driven by [`with_resource_active`], which guarantees `exit()`
//! runs whatever the body returns.

pub mod catalog;

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::host::{Host, HostError};
use catalog::{ResourceSpec, Step};

/// Command failures that are expected during install and removal.
///
/// Anything not listed here is fatal when loading and an error-level log when
/// unloading. Transport failures never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenignFailure {
    /// The module is already inserted (`insmod: ... File exists`).
    AlreadyPresent,
    /// The module is not loaded (`rmmod: ... is not currently loaded`).
    NotLoaded,
    /// The module is still referenced (`rmmod: ... is in use`).
    InUse,
}

impl BenignFailure {
    const ALL: [BenignFailure; 3] = [
        BenignFailure::AlreadyPresent,
        BenignFailure::NotLoaded,
        BenignFailure::InUse,
    ];

    fn signatures(self) -> &'static [&'static str] {
        match self {
            BenignFailure::AlreadyPresent => &["File exists", "already exists"],
            BenignFailure::NotLoaded => &["not currently loaded"],
            BenignFailure::InUse => &["in use"],
        }
    }

    /// Matches a failed command's output against the known signatures.
    pub fn classify(err: &HostError) -> Option<BenignFailure> {
        let output = err.command_output()?;
        Self::ALL
            .into_iter()
            .find(|kind| kind.signatures().iter().any(|sig| output.contains(sig)))
    }
}

/// Errors that abort entering a resource scope.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{kind} '{name}' is already {state:?}; nested activation is not allowed")]
    AlreadyEntered {
        kind: &'static str,
        name: &'static str,
        state: ResourceState,
    },

    #[error("Failed to load {kind} '{name}' on {host}: {source}")]
    Load {
        kind: &'static str,
        name: &'static str,
        host: String,
        #[source]
        source: HostError,
    },

    #[error("Failed to activate {kind} '{name}' on {host}: {source}")]
    Activate {
        kind: &'static str,
        name: &'static str,
        host: String,
        #[source]
        source: HostError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unloaded,
    Loaded,
    Active,
}

/// Something with an enter/exit lifecycle that can be driven by
/// [`with_resource_active`].
#[async_trait]
pub trait Scoped: Send {
    /// Brings the scope into effect.
    async fn enter(&mut self) -> Result<()>;

    /// Reverses `enter`. Must not fail and must be safe after a failed
    /// `enter` or a previous `exit`.
    async fn exit(&mut self);
}

/// Runs `body` inside `scope`.
///
/// `exit()` runs whether `enter()` failed, `body` failed, or both succeeded.
/// An `enter()` error is returned without running `body`.
pub async fn with_resource_active<S, F, T>(scope: &mut S, body: F) -> Result<T>
where
    S: Scoped + ?Sized,
    F: Future<Output = Result<T>>,
{
    if let Err(e) = scope.enter().await {
        scope.exit().await;
        return Err(e);
    }

    let result = body.await;
    scope.exit().await;
    result
}

/// Applies one scheduler or congestion control to a client/server pair.
pub struct ResourceController<'h, H: Host + ?Sized> {
    spec: ResourceSpec,
    hosts: [&'h H; 2],
    state: ResourceState,
}

impl<'h, H: Host + ?Sized> ResourceController<'h, H> {
    pub fn new(spec: ResourceSpec, client: &'h H, server: &'h H) -> Self {
        Self {
            spec,
            hosts: [client, server],
            state: ResourceState::Unloaded,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Installs the capability on both hosts.
    pub async fn load(&mut self) -> Result<(), ResourceError> {
        info!(
            "Loading {} {} on all hosts",
            self.spec.kind.as_str(),
            self.spec.name
        );

        for step in self.spec.load_steps() {
            for host in self.hosts {
                match run_step(host, &step).await {
                    Ok(_) => {}
                    Err(e) if BenignFailure::classify(&e) == Some(BenignFailure::AlreadyPresent) => {
                        warn!("{} already present on {}: {}", self.spec.name, host.name(), e);
                    }
                    Err(source) => {
                        return Err(ResourceError::Load {
                            kind: self.spec.kind.as_str(),
                            name: self.spec.name,
                            host: host.name().to_string(),
                            source,
                        });
                    }
                }
            }
        }

        self.state = ResourceState::Loaded;
        Ok(())
    }

    /// Makes the capability the active one system-wide on both hosts.
    pub async fn activate(&mut self) -> Result<(), ResourceError> {
        let cmd = self.spec.activate_command();
        for host in self.hosts {
            host.run_sync(&cmd)
                .await
                .map_err(|source| ResourceError::Activate {
                    kind: self.spec.kind.as_str(),
                    name: self.spec.name,
                    host: host.name().to_string(),
                    source,
                })?;
        }

        info!("Activated {} {}", self.spec.kind.as_str(), self.spec.name);
        self.state = ResourceState::Active;
        Ok(())
    }

    /// Removes the capability from both hosts. Never fails.
    pub async fn unload(&mut self) {
        info!(
            "Unloading {} {} on all hosts",
            self.spec.kind.as_str(),
            self.spec.name
        );

        for step in self.spec.unload_steps() {
            for host in self.hosts {
                let Err(e) = run_step(host, &step).await else {
                    continue;
                };
                match BenignFailure::classify(&e) {
                    Some(BenignFailure::NotLoaded) => {
                        warn!("{} {} was not loaded on {}", self.spec.kind.as_str(), self.spec.name, host.name());
                    }
                    Some(BenignFailure::InUse) => {
                        warn!(
                            "Unable to unload {} on {} as it is still in use",
                            self.spec.name,
                            host.name()
                        );
                    }
                    _ => {
                        error!(
                            "Error while unloading {} {} on {}: {}",
                            self.spec.kind.as_str(),
                            self.spec.name,
                            host.name(),
                            e
                        );
                    }
                }
            }
        }

        self.state = ResourceState::Unloaded;
    }
}

async fn run_step<H: Host + ?Sized>(host: &H, step: &Step) -> Result<String, HostError> {
    match &step.cwd {
        Some(dir) => {
            let dir = host.storage_root().join(dir);
            host.run_in(&step.command, Some(&dir)).await
        }
        None => host.run_sync(&step.command).await,
    }
}

#[async_trait]
impl<'h, H: Host + ?Sized> Scoped for ResourceController<'h, H> {
    async fn enter(&mut self) -> Result<()> {
        if self.state != ResourceState::Unloaded {
            return Err(ResourceError::AlreadyEntered {
                kind: self.spec.kind.as_str(),
                name: self.spec.name,
                state: self.state,
            }
            .into());
        }

        self.load().await?;
        self.activate().await?;
        Ok(())
    }

    async fn exit(&mut self) {
        debug!("Leaving scope of {} {}", self.spec.kind.as_str(), self.spec.name);
        self.unload().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::scripted::{Reply, ScriptedHost};
    use anyhow::anyhow;

    fn pair() -> (ScriptedHost, ScriptedHost) {
        (
            ScriptedHost::new("client", "10.0.0.1"),
            ScriptedHost::new("server", "10.0.0.2"),
        )
    }

    fn ecf() -> ResourceSpec {
        catalog::scheduler("ECFScheduler").unwrap().spec
    }

    #[test]
    fn test_classify_signatures() {
        let err = |stderr: &str| HostError::CommandExecution {
            command: "x".to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        };

        assert_eq!(
            BenignFailure::classify(&err("insmod: ERROR: could not insert module: File exists")),
            Some(BenignFailure::AlreadyPresent)
        );
        assert_eq!(
            BenignFailure::classify(&err("rmmod: ERROR: Module mptcp_ecf is not currently loaded")),
            Some(BenignFailure::NotLoaded)
        );
        assert_eq!(
            BenignFailure::classify(&err("rmmod: ERROR: Module mptcp_balia is in use")),
            Some(BenignFailure::InUse)
        );
        assert_eq!(BenignFailure::classify(&err("permission denied")), None);

        let transport = HostError::Transport {
            host: "h".to_string(),
            reason: "File exists".to_string(),
        };
        assert_eq!(BenignFailure::classify(&transport), None);
    }

    #[tokio::test]
    async fn test_enter_issues_commands_on_both_hosts() {
        let (client, server) = pair();
        let mut controller = ResourceController::new(ecf(), &client, &server);

        controller.enter().await.unwrap();
        assert_eq!(controller.state(), ResourceState::Active);

        for host in [&client, &server] {
            assert_eq!(
                host.commands(),
                vec![
                    "sudo modprobe mptcp_ecf",
                    "sudo sysctl -w net.mptcp.mptcp_scheduler=ecf"
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_build_steps_run_from_source_dir() {
        let (client, server) = pair();
        let spec = catalog::scheduler("LATEScheduler").unwrap().spec;
        let mut controller = ResourceController::new(spec, &client, &server);

        controller.enter().await.unwrap();
        assert_eq!(
            client.commands()[0],
            "cd /srv/bench/schedulers/custom/late && make"
        );
        assert_eq!(
            client.commands()[1],
            "cd /srv/bench/schedulers/custom/late && sudo insmod mptcp_late.ko"
        );
    }

    #[tokio::test]
    async fn test_load_tolerates_already_present() {
        let (client, server) = pair();
        server.on("modprobe", Reply::fail("modprobe: ERROR: File exists"));
        let mut controller = ResourceController::new(ecf(), &client, &server);

        controller.enter().await.unwrap();
        assert_eq!(controller.state(), ResourceState::Active);
    }

    #[tokio::test]
    async fn test_load_failure_aborts_entry() {
        let (client, server) = pair();
        client.on("modprobe", Reply::fail("modprobe: FATAL: Module mptcp_ecf not found"));
        let mut controller = ResourceController::new(ecf(), &client, &server);

        let err = controller.enter().await.unwrap_err();
        assert!(err.to_string().contains("Failed to load scheduler 'ecf' on client"));
        assert_eq!(client.count("sysctl"), 0);
        assert_eq!(server.count("modprobe"), 0);
    }

    #[tokio::test]
    async fn test_activation_failure_is_fatal() {
        let (client, server) = pair();
        server.on("sysctl", Reply::fail("sysctl: setting key: Invalid argument"));
        let mut controller = ResourceController::new(ecf(), &client, &server);

        assert!(controller.enter().await.is_err());
        assert_eq!(controller.state(), ResourceState::Loaded);
    }

    #[tokio::test]
    async fn test_reentry_rejected() {
        let (client, server) = pair();
        let mut controller = ResourceController::new(ecf(), &client, &server);

        controller.enter().await.unwrap();
        let err = controller.enter().await.unwrap_err();
        assert!(err.to_string().contains("nested activation"));
        assert_eq!(client.count("modprobe"), 1);
    }

    #[tokio::test]
    async fn test_exit_twice_is_harmless() {
        let (client, server) = pair();
        let mut controller = ResourceController::new(ecf(), &client, &server);
        controller.enter().await.unwrap();

        controller.exit().await;
        for host in [&client, &server] {
            host.on("rmmod", Reply::fail("rmmod: ERROR: Module mptcp_ecf is not currently loaded"));
        }
        controller.exit().await;

        assert_eq!(controller.state(), ResourceState::Unloaded);
        assert_eq!(client.count("sudo rmmod mptcp_ecf"), 2);
        assert_eq!(server.count("sudo rmmod mptcp_ecf"), 2);
    }

    #[tokio::test]
    async fn test_unload_continues_after_failure_on_one_host() {
        let (client, server) = pair();
        client.on("rmmod", Reply::Transport);
        let mut controller = ResourceController::new(ecf(), &client, &server);

        controller.unload().await;
        assert_eq!(server.count("rmmod"), 1);
        assert_eq!(controller.state(), ResourceState::Unloaded);
    }

    #[tokio::test]
    async fn test_with_resource_active_exits_after_body_error() {
        let (client, server) = pair();
        let mut controller = ResourceController::new(ecf(), &client, &server);

        let result: Result<()> =
            with_resource_active(&mut controller, async { Err(anyhow!("transfer failed")) }).await;

        assert_eq!(result.unwrap_err().to_string(), "transfer failed");
        assert_eq!(controller.state(), ResourceState::Unloaded);
        assert_eq!(client.count("rmmod"), 1);
    }

    #[tokio::test]
    async fn test_with_resource_active_exits_after_failed_enter() {
        let (client, server) = pair();
        client.on("sysctl", Reply::fail("Invalid argument"));
        let mut controller = ResourceController::new(ecf(), &client, &server);
        let mut ran = false;

        let result = with_resource_active(&mut controller, async {
            ran = true;
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert!(!ran);
        assert_eq!(client.count("rmmod"), 1);
        assert_eq!(server.count("rmmod"), 1);
    }

    #[tokio::test]
    async fn test_builtin_resource_only_activates() {
        let (client, server) = pair();
        let cubic = catalog::congestion_control("cubic").unwrap();
        let mut controller = ResourceController::new(cubic, &client, &server);

        with_resource_active(&mut controller, async { Ok(()) }).await.unwrap();
        assert_eq!(
            client.commands(),
            vec!["sudo sysctl -w net.ipv4.tcp_congestion_control=cubic"]
        );
    }
}
