//! Lookup tables for schedulers, congestion controls and server profiles.
//!
//! Every configured name resolves to a [`ResourceSpec`] describing how the
//! capability is installed, activated and removed. Schedulers additionally
//! carry the [`ServerProfile`] their test server needs.
//!
//! | Install | Load | Unload |
//! |---------|------|--------|
//! | `BuiltIn` | nothing | nothing |
//! | `Modprobe` | `sudo modprobe mptcp_<token>` | `sudo rmmod mptcp_<token>` |
//! | `Build` | `make`, `sudo insmod mptcp_<token>.ko` | `make clean`, `sudo rmmod mptcp_<token>` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Unsupported scheduler: {0}")]
    UnknownScheduler(String),

    #[error("Unsupported congestion control: {0}")]
    UnknownCongestionControl(String),
}

/// Kernel subsystem a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Scheduler,
    CongestionControl,
}

impl ResourceKind {
    pub fn sysctl_key(self) -> &'static str {
        match self {
            ResourceKind::Scheduler => "net.mptcp.mptcp_scheduler",
            ResourceKind::CongestionControl => "net.ipv4.tcp_congestion_control",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Scheduler => "scheduler",
            ResourceKind::CongestionControl => "congestion control",
        }
    }
}

/// How a resource's kernel module gets onto a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    /// Compiled into the kernel; nothing to load or unload.
    BuiltIn,
    /// Shipped as a module in the kernel tree.
    Modprobe,
    /// Built from source under `<storage_root>/schedulers/custom/<dir>`.
    Build { dir: &'static str },
}

/// A single command issued by a resource controller, optionally from a
/// directory relative to the host's storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: String,
    pub cwd: Option<PathBuf>,
}

impl Step {
    fn new(command: String) -> Self {
        Self { command, cwd: None }
    }

    fn within(command: String, dir: &str) -> Self {
        Self {
            command,
            cwd: Some(Path::new("schedulers").join("custom").join(dir)),
        }
    }
}

/// Behaviour-relevant data of a scheduler or congestion control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Short name used in logs.
    pub name: &'static str,
    /// Module suffix and sysctl value.
    pub token: &'static str,
    pub install: Install,
}

impl ResourceSpec {
    const fn new(kind: ResourceKind, name: &'static str, token: &'static str, install: Install) -> Self {
        Self {
            kind,
            name,
            token,
            install,
        }
    }

    pub fn load_steps(&self) -> Vec<Step> {
        match self.install {
            Install::BuiltIn => Vec::new(),
            Install::Modprobe => vec![Step::new(format!("sudo modprobe mptcp_{}", self.token))],
            Install::Build { dir } => vec![
                Step::within("make".to_string(), dir),
                Step::within(format!("sudo insmod mptcp_{}.ko", self.token), dir),
            ],
        }
    }

    pub fn unload_steps(&self) -> Vec<Step> {
        match self.install {
            Install::BuiltIn => Vec::new(),
            Install::Modprobe => vec![Step::new(format!("sudo rmmod mptcp_{}", self.token))],
            Install::Build { dir } => vec![
                Step::within("make clean".to_string(), dir),
                Step::within(format!("sudo rmmod mptcp_{}", self.token), dir),
            ],
        }
    }

    pub fn activate_command(&self) -> String {
        format!("sudo sysctl -w {}={}", self.kind.sysctl_key(), self.token)
    }
}

/// How the test server for a scheduler is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerProfile {
    pub name: &'static str,
    /// Directory under `<storage_root>/servers/payload/`.
    pub payload_dir: &'static str,
    pub script: &'static str,
    /// Time the server needs before it accepts transfers.
    pub settle: Duration,
    /// Run as `sudo mptcpize run python3 ...` rather than plain `python3 ...`.
    pub mptcpize: bool,
    /// Learning-based server; accepts `--continue_train`.
    pub learning: bool,
}

impl ServerProfile {
    pub const DEFAULT: ServerProfile = ServerProfile {
        name: "default",
        payload_dir: "default",
        script: "server_payload.py",
        settle: Duration::from_secs(5),
        mptcpize: true,
        learning: false,
    };

    pub const FALCON: ServerProfile = ServerProfile {
        name: "FALCON",
        payload_dir: "falcon",
        script: "falcon_server_payload.py",
        settle: Duration::from_secs(15),
        mptcpize: true,
        learning: true,
    };

    pub const RELES: ServerProfile = ServerProfile {
        name: "RELES",
        payload_dir: "reles",
        script: "reles_server_payload.py",
        settle: Duration::from_secs(7),
        mptcpize: false,
        learning: true,
    };

    pub const FALCON_EXT: ServerProfile = ServerProfile {
        name: "FALCON_EXT",
        payload_dir: "falcon_ext",
        script: "falcon_ext_server_payload.py",
        settle: Duration::from_secs(15),
        mptcpize: true,
        learning: true,
    };

    pub const RELES_EXT: ServerProfile = ServerProfile {
        name: "RELES_EXT",
        payload_dir: "reles_ext",
        script: "reles_ext_server_payload.py",
        settle: Duration::from_secs(7),
        mptcpize: false,
        learning: true,
    };
}

/// A resolved scheduler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerEntry {
    pub spec: ResourceSpec,
    pub server: ServerProfile,
}

const fn sched(name: &'static str, token: &'static str, install: Install, server: ServerProfile) -> SchedulerEntry {
    SchedulerEntry {
        spec: ResourceSpec::new(ResourceKind::Scheduler, name, token, install),
        server,
    }
}

const SCHEDULERS: &[(&str, SchedulerEntry)] = &[
    ("MinRTTScheduler", sched("minrtt", "default", Install::BuiltIn, ServerProfile::DEFAULT)),
    ("DefaultScheduler", sched("minrtt", "default", Install::BuiltIn, ServerProfile::DEFAULT)),
    ("RoundRobinScheduler", sched("roundrobin", "rr", Install::Modprobe, ServerProfile::DEFAULT)),
    ("ECFScheduler", sched("ecf", "ecf", Install::Modprobe, ServerProfile::DEFAULT)),
    ("BLESTScheduler", sched("blest", "blest", Install::Modprobe, ServerProfile::DEFAULT)),
    ("RedundantScheduler", sched("redundant", "redundant", Install::Modprobe, ServerProfile::DEFAULT)),
    ("LATEScheduler", sched("late", "late", Install::Build { dir: "late" }, ServerProfile::DEFAULT)),
    ("FALCONScheduler", sched("falcon", "falcon", Install::Build { dir: "falcon" }, ServerProfile::FALCON)),
    ("RELESScheduler", sched("reles", "reles", Install::Build { dir: "reles" }, ServerProfile::RELES)),
    (
        "FALCONExtScheduler",
        sched("falcon_ext", "falcon_ext", Install::Build { dir: "falcon_ext" }, ServerProfile::FALCON_EXT),
    ),
    (
        "RELESExtScheduler",
        sched("reles_ext", "reles_ext", Install::Build { dir: "reles_ext" }, ServerProfile::RELES_EXT),
    ),
];

const CONGESTION_CONTROLS: &[ResourceSpec] = &[
    ResourceSpec::new(ResourceKind::CongestionControl, "cubic", "cubic", Install::BuiltIn),
    ResourceSpec::new(ResourceKind::CongestionControl, "olia", "olia", Install::BuiltIn),
    ResourceSpec::new(ResourceKind::CongestionControl, "bbr", "bbr", Install::BuiltIn),
    ResourceSpec::new(ResourceKind::CongestionControl, "balia", "balia", Install::Modprobe),
    ResourceSpec::new(ResourceKind::CongestionControl, "wvegas", "wvegas", Install::Modprobe),
];

/// Resolves a configured scheduler name such as `ECFScheduler`.
pub fn scheduler(name: &str) -> Result<SchedulerEntry, CatalogError> {
    SCHEDULERS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, entry)| *entry)
        .ok_or_else(|| CatalogError::UnknownScheduler(name.to_string()))
}

/// Resolves a configured congestion-control name such as `cubic`.
pub fn congestion_control(name: &str) -> Result<ResourceSpec, CatalogError> {
    CONGESTION_CONTROLS
        .iter()
        .find(|spec| spec.name == name)
        .copied()
        .ok_or_else(|| CatalogError::UnknownCongestionControl(name.to_string()))
}

/// All configurable scheduler names.
pub fn scheduler_names() -> impl Iterator<Item = &'static str> {
    SCHEDULERS.iter().map(|(key, _)| *key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_aliases_share_token() {
        let minrtt = scheduler("MinRTTScheduler").unwrap();
        let default = scheduler("DefaultScheduler").unwrap();
        assert_eq!(minrtt, default);
        assert_eq!(minrtt.spec.install, Install::BuiltIn);
        assert!(minrtt.spec.load_steps().is_empty());
        assert_eq!(
            minrtt.spec.activate_command(),
            "sudo sysctl -w net.mptcp.mptcp_scheduler=default"
        );
    }

    #[test]
    fn test_modprobe_commands() {
        let rr = scheduler("RoundRobinScheduler").unwrap();
        assert_eq!(rr.spec.load_steps(), vec![Step::new("sudo modprobe mptcp_rr".to_string())]);
        assert_eq!(rr.spec.unload_steps(), vec![Step::new("sudo rmmod mptcp_rr".to_string())]);
    }

    #[test]
    fn test_build_from_source_commands() {
        let falcon = scheduler("FALCONScheduler").unwrap();
        let load = falcon.spec.load_steps();
        assert_eq!(load.len(), 2);
        assert_eq!(load[0].command, "make");
        assert_eq!(load[1].command, "sudo insmod mptcp_falcon.ko");
        assert_eq!(load[1].cwd.as_deref(), Some(Path::new("schedulers/custom/falcon")));

        let unload = falcon.spec.unload_steps();
        assert_eq!(unload[0].command, "make clean");
        assert_eq!(unload[1].command, "sudo rmmod mptcp_falcon");
        assert_eq!(falcon.server, ServerProfile::FALCON);
    }

    #[test]
    fn test_server_profiles() {
        assert_eq!(scheduler("ECFScheduler").unwrap().server.settle, Duration::from_secs(5));
        assert_eq!(scheduler("FALCONExtScheduler").unwrap().server.settle, Duration::from_secs(15));
        let reles = scheduler("RELESExtScheduler").unwrap().server;
        assert_eq!(reles.settle, Duration::from_secs(7));
        assert!(!reles.mptcpize);
        assert!(reles.learning);
        assert!(!scheduler("LATEScheduler").unwrap().server.learning);
    }

    #[test]
    fn test_congestion_controls() {
        let cubic = congestion_control("cubic").unwrap();
        assert!(cubic.unload_steps().is_empty());
        assert_eq!(
            cubic.activate_command(),
            "sudo sysctl -w net.ipv4.tcp_congestion_control=cubic"
        );
        assert_eq!(congestion_control("balia").unwrap().install, Install::Modprobe);
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(
            congestion_control("reno"),
            Err(CatalogError::UnknownCongestionControl("reno".to_string()))
        );
        assert!(scheduler("ecf").is_err());
        assert_eq!(scheduler_names().count(), 11);
    }
}
