//! Configuration loading and schema definitions for mptcp-bench.
//!
//! This module provides types and functions for loading campaign configuration
//! from TOML files or strings, and for checking a loaded configuration against
//! the scheduler and congestion-control catalogs before any host is touched.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::checkpoint::KEY_DELIMITER;
use crate::resource::catalog;
use crate::subject::FileSize;

/// Loads campaign configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use mptcp_bench::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("campaign.toml"))?;
/// println!("Iterations: {}", config.test.num_iterations);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads campaign configuration from a TOML string.
///
/// # Example
///
/// ```
/// use mptcp_bench::config::load_config_str;
///
/// let config = load_config_str(r#"
///     name = "smoke"
///     congestion_controls = ["cubic"]
///
///     [[schedulers]]
///     name = "DefaultScheduler"
///
///     [topology]
///     type = "local"
///     client = { name = "h1" }
///     server = { name = "h2" }
///
///     [test]
///     num_iterations = 1
///     file_sizes = ["64K"]
/// "#)?;
///
/// assert_eq!(config.test.max_retries, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks a configuration for problems that would only surface mid-campaign.
///
/// Every scheduler and congestion control must be in the catalog, every file
/// size must parse, and no sweep axis may contain the checkpoint key delimiter.
pub fn validate(config: &Config) -> Result<()> {
    if config.schedulers.is_empty() {
        bail!("No schedulers configured");
    }
    if config.congestion_controls.is_empty() {
        bail!("No congestion controls configured");
    }
    if config.test.file_sizes.is_empty() {
        bail!("No file sizes configured");
    }
    if config.test.num_iterations == 0 {
        bail!("test.num_iterations must be at least 1");
    }

    for scheduler in &config.schedulers {
        check_axis("scheduler", &scheduler.name)?;
        catalog::scheduler(&scheduler.name)
            .with_context(|| format!("Invalid scheduler entry '{}'", scheduler.name))?;
    }

    for cc in &config.congestion_controls {
        check_axis("congestion control", cc)?;
        catalog::congestion_control(cc)
            .with_context(|| format!("Invalid congestion control entry '{}'", cc))?;
    }

    for size in &config.test.file_sizes {
        check_axis("file size", size)?;
        size.parse::<FileSize>()
            .with_context(|| format!("Invalid file size entry '{}'", size))?;
    }

    Ok(())
}

fn check_axis(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("Empty {} name", kind);
    }
    if value.contains(KEY_DELIMITER) {
        bail!("{} '{}' contains the reserved sequence '{}'", kind, value, KEY_DELIMITER);
    }
    if value.starts_with('|') || value.ends_with('|') {
        bail!("{} '{}' may not start or end with '|'", kind, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = r#"
        name = "baseline"
        network_env = "mininet"
        congestion_controls = ["cubic", "olia"]

        [[schedulers]]
        name = "ECFScheduler"

        [[schedulers]]
        name = "FALCONScheduler"
        params = { continue_train = 1, server_debug = false }

        [topology]
        type = "local"

        [topology.client]
        name = "h1"
        namespace = "h1"

        [topology.server]
        name = "h2"
        namespace = "h2"

        [test]
        num_iterations = 3
        file_sizes = ["64K", "1M"]
        server_port = 8000
        checkpoint = true
    "#;

    #[test]
    fn test_parse_local_topology() {
        let config = load_config_str(LOCAL).unwrap();

        assert_eq!(config.name, "baseline");
        assert_eq!(config.network_env, "mininet");
        assert_eq!(config.schedulers.len(), 2);
        assert_eq!(
            config.schedulers[1].params.get("continue_train"),
            Some(&serde_json::json!(1))
        );
        match &config.topology {
            TopologyConfig::Local { client, server } => {
                assert_eq!(client.namespace.as_deref(), Some("h1"));
                assert_eq!(server.shell, "/bin/sh");
            }
            other => panic!("unexpected topology: {other:?}"),
        }
        assert_eq!(config.test.server_port, Some(8000));
        assert!(config.test.checkpoint);
        assert_eq!(config.test.max_retries, 2);
        assert_eq!(config.test.retry_interval_secs, 30);
        assert_eq!(config.test.subject, SubjectConfig::Python);
        assert_eq!(config.results.dir, Path::new("results"));
        assert_eq!(config.logging.level, "info");
        validate(&config).unwrap();
    }

    #[test]
    fn test_parse_ssh_topology_defaults() {
        let config = load_config_str(
            r#"
            name = "lab"
            congestion_controls = ["cubic"]
            schedulers = [{ name = "DefaultScheduler" }]

            [topology]
            type = "ssh"

            [topology.client]
            hostname = "10.0.0.1"
            username = "bench"
            password = "secret"

            [topology.server]
            hostname = "10.0.0.2"
            username = "bench"
            key_path = "~/.ssh/id_ed25519"
            venv_path = "/opt/venv"

            [test]
            num_iterations = 1
            file_size = ["10M"]

            [test.subject]
            type = "native"
        "#,
        )
        .unwrap();

        let TopologyConfig::Ssh { client, server } = &config.topology else {
            panic!("expected ssh topology");
        };
        assert_eq!(client.port, 22);
        assert_eq!(client.storage_root, "/tmp/mptcp-bench");
        assert_eq!(client.command_timeout_secs, 1800);
        assert_eq!(server.venv_path.as_deref(), Some("/opt/venv"));
        assert_eq!(config.test.file_sizes, vec!["10M"]);
        assert_eq!(
            config.test.subject,
            SubjectConfig::Native {
                binary: "mptcp-bench".to_string()
            }
        );
    }

    #[test]
    fn test_password_not_serialized() {
        let config = load_config_str(LOCAL).unwrap();
        let host = SshHostConfig {
            hostname: "h".to_string(),
            username: "u".to_string(),
            password: Some("hunter2".to_string()),
            key_path: None,
            port: 22,
            storage_root: "/tmp".to_string(),
            venv_path: None,
            disable_host_key_check: false,
            command_timeout_secs: 10,
            upload_dirs: Vec::new(),
        };

        let json = serde_json::to_string(&host).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!config.topology.identity().to_string().contains("shell"));
    }

    #[test]
    fn test_unknown_topology_type_rejected() {
        let err = load_config_str(&LOCAL.replace("type = \"local\"", "type = \"docker\""));
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_names() {
        let mut config = load_config_str(LOCAL).unwrap();
        config.congestion_controls.push("reno".to_string());
        let err = validate(&config).unwrap_err();
        assert!(format!("{err:#}").contains("reno"));

        let mut config = load_config_str(LOCAL).unwrap();
        config.schedulers[0].name = "NoSuchScheduler".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sizes_and_delimiter() {
        let mut config = load_config_str(LOCAL).unwrap();
        config.test.file_sizes = vec!["12X".to_string()];
        assert!(validate(&config).is_err());

        let mut config = load_config_str(LOCAL).unwrap();
        config.test.file_sizes = vec!["1M|||2M".to_string()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("|||"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/campaign.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
