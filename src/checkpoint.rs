//! Durable, resumable campaign results.
//!
//! The checkpoint is a single JSON document at `<results.dir>/checkpoint.json`
//! holding the campaign fingerprint next to the measurements recorded so far:
//!
//! ```json
//! {
//!   "name": "baseline",
//!   "network_env": "mininet",
//!   "topology": { "type": "local", "client": { .. }, "server": { .. } },
//!   "schedulers": [ { "name": "ECFScheduler", "params": {} } ],
//!   "test": { "num_iterations": 3, "file_sizes": ["1M"], .. },
//!   "results_dir": "results",
//!   "fingerprint_sha256": "9f2c…",
//!   "results": { "ECFScheduler|||cubic|||1M": [12.1, 11.9, 12.4] }
//! }
//! ```
//!
//! A checkpoint is only trusted when its fingerprint is compatible with the
//! current configuration, see [`CampaignFingerprint::check_compatibility`].
//! Anything else (incompatible, unparsable, bad keys) is deleted and the
//! campaign starts from scratch.
//!
//! # Example
//!
//! ```no_run
//! use mptcp_bench::checkpoint::{CampaignFingerprint, CheckpointStore, ExperimentKey};
//! use mptcp_bench::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("campaign.toml"))?;
//! let mut store = CheckpointStore::open(
//!     CheckpointStore::default_path(&config),
//!     CampaignFingerprint::from_config(&config),
//!     config.test.checkpoint,
//! );
//!
//! let key = ExperimentKey::new("ECFScheduler", "cubic", "1M")?;
//! if !store.is_completed(&key) {
//!     store.record(key, vec![12.5, 13.0])?;
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod summary;

pub use summary::{SummaryRow, render_grid, render_table, summarize};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, SchedulerConfig};

/// Separator of the three key components in the checkpoint file.
pub const KEY_DELIMITER: &str = "|||";

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The stored fingerprint differs from the current configuration.
    #[error("Checkpoint is incompatible with the current configuration ({field} differs)")]
    ConfigIncompatible { field: String },

    /// The file exists but is not a checkpoint document.
    #[error("Checkpoint file is corrupt: {0}")]
    Corrupt(String),

    /// A key does not split into exactly three components, or a component
    /// contains the delimiter or starts or ends with `|`.
    #[error("Malformed experiment key: '{0}'")]
    MalformedKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identifies one combination of the sweep.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExperimentKey {
    scheduler: String,
    congestion_control: String,
    file_size: String,
}

impl ExperimentKey {
    pub fn new(
        scheduler: impl Into<String>,
        congestion_control: impl Into<String>,
        file_size: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let key = Self {
            scheduler: scheduler.into(),
            congestion_control: congestion_control.into(),
            file_size: file_size.into(),
        };

        // A leading or trailing '|' would merge with the delimiter when decoding.
        if [&key.scheduler, &key.congestion_control, &key.file_size]
            .iter()
            .any(|part| part.contains(KEY_DELIMITER) || part.starts_with('|') || part.ends_with('|'))
        {
            return Err(CheckpointError::MalformedKey(key.encode()));
        }
        Ok(key)
    }

    pub fn scheduler(&self) -> &str {
        &self.scheduler
    }

    pub fn congestion_control(&self) -> &str {
        &self.congestion_control
    }

    pub fn file_size(&self) -> &str {
        &self.file_size
    }

    /// `scheduler|||congestion_control|||file_size`
    pub fn encode(&self) -> String {
        [
            self.scheduler.as_str(),
            self.congestion_control.as_str(),
            self.file_size.as_str(),
        ]
        .join(KEY_DELIMITER)
    }

    pub fn decode(encoded: &str) -> Result<Self, CheckpointError> {
        let parts: Vec<&str> = encoded.split(KEY_DELIMITER).collect();
        match parts.as_slice() {
            [scheduler, cc, size] => Self::new(*scheduler, *cc, *size),
            _ => Err(CheckpointError::MalformedKey(encoded.to_string())),
        }
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scheduler '{}', congestion control '{}', file size {}",
            self.scheduler, self.congestion_control, self.file_size
        )
    }
}

/// The identity-relevant subset of a campaign configuration.
///
/// Credentials, transport tuning and retry policy are left out; changing
/// them does not invalidate recorded measurements. Congestion controls are
/// left out as well, so extending that list resumes the campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignFingerprint {
    pub name: String,
    pub network_env: String,
    pub topology: serde_json::Value,
    pub schedulers: Vec<SchedulerConfig>,
    pub test: serde_json::Value,
    pub results_dir: PathBuf,
}

impl CampaignFingerprint {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.name.clone(),
            network_env: config.network_env.clone(),
            topology: config.topology.identity(),
            schedulers: config.schedulers.clone(),
            test: serde_json::json!({
                "num_iterations": config.test.num_iterations,
                "file_sizes": config.test.file_sizes,
                "server_port": config.test.server_port,
                "subject": config.test.subject,
            }),
            results_dir: config.results.dir.clone(),
        }
    }

    /// Checks whether measurements recorded under `stored` may be reused.
    ///
    /// All fields except `schedulers` must match exactly. Schedulers are
    /// compared by name: only schedulers present in both fingerprints must
    /// have equal parameters. Adding or removing schedulers therefore keeps
    /// the checkpoint, and its summary may mix scheduler sets.
    pub fn check_compatibility(&self, stored: &Self) -> Result<(), CheckpointError> {
        let incompatible = |field: &str| {
            Err(CheckpointError::ConfigIncompatible {
                field: field.to_string(),
            })
        };

        if self.name != stored.name {
            return incompatible("name");
        }
        if self.network_env != stored.network_env {
            return incompatible("network_env");
        }
        if self.topology != stored.topology {
            return incompatible("topology");
        }
        if self.test != stored.test {
            return incompatible("test");
        }
        if self.results_dir != stored.results_dir {
            return incompatible("results_dir");
        }

        let stored_params: HashMap<&str, _> = stored
            .schedulers
            .iter()
            .map(|s| (s.name.as_str(), &s.params))
            .collect();
        for scheduler in &self.schedulers {
            if let Some(params) = stored_params.get(scheduler.name.as_str())
                && **params != scheduler.params
            {
                return incompatible(&format!("schedulers.{}.params", scheduler.name));
            }
        }

        Ok(())
    }

    pub fn is_compatible(&self, stored: &Self) -> bool {
        self.check_compatibility(stored).is_ok()
    }

    /// SHA-256 of the canonical JSON form, for logs.
    pub fn sha256(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(flatten)]
    fingerprint: CampaignFingerprint,
    #[serde(default)]
    fingerprint_sha256: Option<String>,
    #[serde(default)]
    results: BTreeMap<String, Vec<f64>>,
}

/// Measurements keyed by combination, persisted after every record.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    enabled: bool,
    fingerprint: CampaignFingerprint,
    results: BTreeMap<ExperimentKey, Vec<f64>>,
}

impl CheckpointStore {
    /// `<results.dir>/checkpoint.json`
    pub fn default_path(config: &Config) -> PathBuf {
        config.results.dir.join("checkpoint.json")
    }

    /// Opens the store, reusing a compatible checkpoint if one exists.
    ///
    /// With checkpointing disabled the file is neither read nor written.
    /// A checkpoint that cannot be trusted is deleted.
    pub fn open(path: PathBuf, fingerprint: CampaignFingerprint, enabled: bool) -> Self {
        let mut store = Self {
            path,
            enabled,
            fingerprint,
            results: BTreeMap::new(),
        };

        if !store.enabled {
            debug!("Checkpointing disabled");
            return store;
        }
        if !store.path.exists() {
            debug!("No checkpoint at {}", store.path.display());
            return store;
        }

        match read_checkpoint(&store.path, &store.fingerprint) {
            Ok(results) => {
                info!(
                    "Resuming from checkpoint {} ({} completed combinations)",
                    store.path.display(),
                    results.len()
                );
                store.results = results;
            }
            Err(e) => {
                warn!("Discarding checkpoint {}: {}", store.path.display(), e);
                if let Err(e) = std::fs::remove_file(&store.path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to delete checkpoint {}: {}", store.path.display(), e);
                }
            }
        }

        store
    }

    /// Reads a checkpoint for display without validating it against a
    /// configuration.
    pub fn read_unchecked(path: &Path) -> Result<(CampaignFingerprint, BTreeMap<ExperimentKey, Vec<f64>>), CheckpointError> {
        let file = parse_file(path)?;
        let results = decode_results(file.results)?;
        Ok((file.fingerprint, results))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_completed(&self, key: &ExperimentKey) -> bool {
        self.results.contains_key(key)
    }

    pub fn get(&self, key: &ExperimentKey) -> Option<&[f64]> {
        self.results.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Stores the measurements for `key`, replacing earlier ones, and
    /// persists the whole store before returning.
    ///
    /// If persisting fails the in-memory store is left as it was, so the
    /// combination is not reported as completed.
    pub fn record(&mut self, key: ExperimentKey, measurements: Vec<f64>) -> Result<(), CheckpointError> {
        let previous = self.results.insert(key.clone(), measurements);
        if self.enabled
            && let Err(e) = self.persist()
        {
            match previous {
                Some(old) => self.results.insert(key, old),
                None => self.results.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Per-combination min/max/mean, in key order. Empty entries are skipped.
    pub fn summarize(&self) -> Vec<SummaryRow> {
        summary::summarize(&self.results)
    }

    fn persist(&self) -> Result<(), CheckpointError> {
        let file = CheckpointFile {
            fingerprint: self.fingerprint.clone(),
            fingerprint_sha256: Some(self.fingerprint.sha256()),
            results: self
                .results
                .iter()
                .map(|(key, values)| (key.encode(), values.clone()))
                .collect(),
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        // Write to a sibling temp file and rename so readers never see a partial file.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!("Saved {} results to {}", self.results.len(), self.path.display());
        Ok(())
    }
}

fn parse_file(path: &Path) -> Result<CheckpointFile, CheckpointError> {
    let contents = std::fs::read_to_string(path).map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| CheckpointError::Corrupt(e.to_string()))
}

fn decode_results(
    encoded: BTreeMap<String, Vec<f64>>,
) -> Result<BTreeMap<ExperimentKey, Vec<f64>>, CheckpointError> {
    encoded
        .into_iter()
        .map(|(key, values)| Ok((ExperimentKey::decode(&key)?, values)))
        .collect()
}

fn read_checkpoint(
    path: &Path,
    fingerprint: &CampaignFingerprint,
) -> Result<BTreeMap<ExperimentKey, Vec<f64>>, CheckpointError> {
    let file = parse_file(path)?;
    fingerprint.check_compatibility(&file.fingerprint)?;
    decode_results(file.results)
}
