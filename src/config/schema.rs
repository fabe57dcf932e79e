//! Configuration schema definitions for mptcp-bench.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML campaign files. Tagged enums select the topology backend and the test
//! subject implementation.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── name, network_env       - Campaign identity
//! ├── schedulers              - Scheduler entries (name + params)
//! ├── congestion_controls     - Congestion-control names
//! ├── TopologyConfig          - Tagged enum selecting the host backend
//! │   ├── Local               - Local/namespaced processes
//! │   └── Ssh                 - Remote hosts over SSH
//! ├── TestConfig              - Iterations, file sizes, retries, checkpointing
//! │   └── SubjectConfig       - Python payloads or the native payload
//! ├── ResultsConfig           - Output directory
//! └── LoggingConfig           - Default log level
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for a campaign.
///
/// Top-level keys must appear before the first table in TOML.
///
/// # Example
///
/// ```
/// use mptcp_bench::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     name = "baseline"
///     congestion_controls = ["cubic"]
///
///     [[schedulers]]
///     name = "ECFScheduler"
///
///     [topology]
///     type = "local"
///
///     [topology.client]
///     name = "h1"
///
///     [topology.server]
///     name = "h2"
///
///     [test]
///     num_iterations = 5
///     file_sizes = ["1M"]
/// "#).unwrap();
///
/// assert_eq!(config.schedulers[0].name, "ECFScheduler");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Campaign name; also names the per-run output directory.
    pub name: String,

    /// Free-form label of the network environment (e.g. "mininet", "physical").
    #[serde(default = "default_network_env")]
    pub network_env: String,

    /// Congestion-control algorithm names, in sweep order.
    pub congestion_controls: Vec<String>,

    /// Scheduler entries, in sweep order.
    pub schedulers: Vec<SchedulerConfig>,

    /// Client/server host pair.
    pub topology: TopologyConfig,

    /// Test parameters.
    pub test: TestConfig,

    /// Output settings (optional, has defaults).
    #[serde(default)]
    pub results: ResultsConfig,

    /// Log settings (optional, has defaults).
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_network_env() -> String {
    "physical".to_string()
}

/// One scheduler under test.
///
/// `params` are passed to learning-based schedulers' servers (for example
/// `continue_train` and `server_debug`) and take part in checkpoint
/// compatibility checks.
///
/// ```toml
/// [[schedulers]]
/// name = "FALCONScheduler"
/// params = { continue_train = 1 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Catalog name, e.g. `ECFScheduler`.
    pub name: String,

    /// Scheduler-specific parameters.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Host pair configuration.
///
/// | Type | Description |
/// |------|-------------|
/// | `local` | Commands run locally, optionally inside network namespaces |
/// | `ssh` | Commands run on remote machines over SSH |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TopologyConfig {
    /// Local or emulated hosts.
    Local {
        client: LocalHostConfig,
        server: LocalHostConfig,
    },

    /// Remote hosts.
    Ssh {
        client: SshHostConfig,
        server: SshHostConfig,
    },
}

impl TopologyConfig {
    /// Identity-relevant view of the topology, free of credentials and
    /// transport tuning.
    pub fn identity(&self) -> serde_json::Value {
        match self {
            TopologyConfig::Local { client, server } => serde_json::json!({
                "type": "local",
                "client": local_identity(client),
                "server": local_identity(server),
            }),
            TopologyConfig::Ssh { client, server } => serde_json::json!({
                "type": "ssh",
                "client": ssh_identity(client),
                "server": ssh_identity(server),
            }),
        }
    }
}

fn local_identity(host: &LocalHostConfig) -> serde_json::Value {
    serde_json::json!({
        "name": host.name,
        "namespace": host.namespace,
        "storage_root": host.storage_root,
    })
}

fn ssh_identity(host: &SshHostConfig) -> serde_json::Value {
    serde_json::json!({
        "hostname": host.hostname,
        "username": host.username,
        "port": host.port,
        "storage_root": host.storage_root,
    })
}

/// Configuration for a local host.
///
/// # Example
///
/// ```toml
/// [topology.client]
/// name = "h1"
/// namespace = "h1"
/// shell = "/bin/bash"
///
/// [topology.client.env]
/// PYTHONUNBUFFERED = "1"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalHostConfig {
    /// Name used in logs.
    pub name: String,

    /// Network namespace to run commands in (`ip netns exec`).
    pub namespace: Option<String>,

    /// Shell used as `{shell} -c "{command}"`.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Directory holding payloads and kernel sources.
    ///
    /// Default: current directory
    pub storage_root: Option<PathBuf>,

    /// Extra environment variables for every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for LocalHostConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            namespace: None,
            shell: default_shell(),
            storage_root: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Configuration for a host reached over SSH.
///
/// Key-based authentication is required; `password` is only used for `sudo`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshHostConfig {
    /// Hostname or IP address.
    pub hostname: String,

    /// Login user.
    pub username: String,

    /// Password fed to `sudo -S`. Never serialized.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Private key; `~` is expanded.
    pub key_path: Option<PathBuf>,

    /// Default: 22
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Remote directory holding payloads and kernel sources.
    ///
    /// Default: `/tmp/mptcp-bench`
    #[serde(default = "default_remote_root")]
    pub storage_root: String,

    /// Virtualenv whose `bin/python3` replaces `python3` in commands.
    pub venv_path: Option<String>,

    /// Skip host key verification. Keep `false` outside lab networks.
    #[serde(default)]
    pub disable_host_key_check: bool,

    /// Transport deadline for synchronous commands.
    ///
    /// Default: 1800
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Local directories copied into `storage_root` when the testbed is prepared.
    #[serde(default)]
    pub upload_dirs: Vec<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_root() -> String {
    "/tmp/mptcp-bench".to_string()
}

fn default_command_timeout() -> u64 {
    1800
}

/// Test parameters.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_retries` | 2 |
/// | `retry_interval_secs` | 30 |
/// | `checkpoint` | false |
/// | `link_test_duration_secs` | 120 |
///
/// # Example
///
/// ```toml
/// [test]
/// num_iterations = 10
/// file_sizes = ["64K", "1M", "10M"]
/// server_port = 8000
/// checkpoint = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestConfig {
    /// Downloads per combination.
    pub num_iterations: u32,

    /// iperf-style size specifiers (`<int>[K|M|G]`).
    #[serde(alias = "file_size")]
    pub file_sizes: Vec<String>,

    /// Port of the transfer server; the payload's default when unset.
    pub server_port: Option<u16>,

    /// Start payloads under the remote debugger.
    #[serde(default)]
    pub server_debug: bool,

    /// Persist results and skip completed combinations on restart.
    #[serde(default)]
    pub checkpoint: bool,

    /// Retries after a failed transfer command.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay between transfer retries.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Duration of each iperf3 run in the link test.
    #[serde(default = "default_link_test_duration")]
    pub link_test_duration_secs: u64,

    /// Implementation of the plain transfer server and client.
    #[serde(default)]
    pub subject: SubjectConfig,
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_interval() -> u64 {
    30
}

fn default_link_test_duration() -> u64 {
    120
}

/// Selects the plain test subject.
///
/// ```toml
/// [test.subject]
/// type = "native"
/// binary = "/usr/local/bin/mptcp-bench"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubjectConfig {
    /// Python payload scripts under each host's storage root.
    #[default]
    Python,

    /// This crate's binary (`payload serve` / `payload fetch`).
    Native {
        #[serde(default = "default_native_binary")]
        binary: String,
    },
}

fn default_native_binary() -> String {
    "mptcp-bench".to_string()
}

/// Output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultsConfig {
    /// Root directory for checkpoint and per-run outputs.
    ///
    /// Default: `results`
    #[serde(default = "default_results_dir")]
    pub dir: PathBuf,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            dir: default_results_dir(),
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Log settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    ///
    /// Default: `info`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
