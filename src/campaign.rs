//! Sweep orchestration.
//!
//! A campaign walks every (scheduler, congestion control, file size)
//! combination in configuration order, strictly one at a time:
//!
//! ```text
//! for scheduler                        ── ResourceController scope
//!   for congestion control             ── ResourceController scope
//!     for file size
//!       checkpointed? ── yes ──► skip
//!       TestServer scope
//!         TransferClient::run_test ──► CheckpointStore::record
//! ```
//!
//! Install and activation costs are paid once per scheduler and once per
//! (scheduler, congestion control) pair. Measurements are recorded only after
//! a successful transfer, so an aborted campaign resumes at the first
//! combination without results.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::checkpoint::{CampaignFingerprint, CheckpointStore, ExperimentKey, SummaryRow, render_table};
use crate::config::{Config, SchedulerConfig};
use crate::host::Host;
use crate::resource::catalog::{self, ResourceSpec, SchedulerEntry};
use crate::resource::{ResourceController, with_resource_active};
use crate::subject::{ServerLaunch, TestServer, TransferClient};
use crate::testbed;

/// Outcome of a completed campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub run_id: Uuid,
    pub name: String,
    pub fingerprint_sha256: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Combinations measured in this run.
    pub completed: usize,
    /// Combinations skipped because the checkpoint already had them.
    pub skipped: usize,
    pub results: Vec<SummaryRow>,
}

pub struct Campaign<'h, H: Host + ?Sized> {
    config: Config,
    client: &'h H,
    server: &'h H,
    store: CheckpointStore,
    run_id: Uuid,
    completed: usize,
    skipped: usize,
}

impl<'h, H: Host + ?Sized> Campaign<'h, H> {
    /// Prepares a campaign; an existing compatible checkpoint is loaded here.
    pub fn new(config: Config, client: &'h H, server: &'h H) -> Self {
        let store = CheckpointStore::open(
            CheckpointStore::default_path(&config),
            CampaignFingerprint::from_config(&config),
            config.test.checkpoint,
        );

        Self {
            config,
            client,
            server,
            store,
            run_id: Uuid::new_v4(),
            completed: 0,
            skipped: 0,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Runs the whole sweep, then logs and writes the summary.
    ///
    /// The first error ends the campaign; results recorded before it stay
    /// in the checkpoint.
    pub async fn run(&mut self) -> Result<CampaignReport> {
        let started_at = Utc::now();
        let fingerprint = CampaignFingerprint::from_config(&self.config);
        info!(
            "Starting campaign '{}' (run {}, fingerprint {})",
            self.config.name,
            self.run_id,
            &fingerprint.sha256()[..12]
        );

        if let Err(e) = self.sweep().await {
            error!("Campaign '{}' aborted: {:#}", self.config.name, e);
            return Err(e);
        }

        let results = self.store.summarize();
        info!("Test Results Summary:\n{}", render_table(&results));

        let report = CampaignReport {
            run_id: self.run_id,
            name: self.config.name.clone(),
            fingerprint_sha256: fingerprint.sha256(),
            started_at,
            finished_at: Utc::now(),
            completed: self.completed,
            skipped: self.skipped,
            results,
        };

        let path = write_summary(&self.config.results.dir, &self.config.name, &report)?;
        info!("Summary written to {}", path.display());
        Ok(report)
    }

    async fn sweep(&mut self) -> Result<()> {
        let schedulers = self
            .config
            .schedulers
            .iter()
            .map(|s| Ok((s.clone(), catalog::scheduler(&s.name)?)))
            .collect::<Result<Vec<_>>>()?;
        let congestion_controls = self
            .config
            .congestion_controls
            .iter()
            .map(|cc| Ok(catalog::congestion_control(cc)?))
            .collect::<Result<Vec<_>>>()?;

        testbed::set_mptcp([self.client, self.server], true)
            .await
            .context("Failed to enable MPTCP")?;

        for (scheduler, entry) in &schedulers {
            let mut controller = ResourceController::new(entry.spec, self.client, self.server);
            with_resource_active(
                &mut controller,
                self.run_scheduler(scheduler, entry, &congestion_controls),
            )
            .await?;
        }

        Ok(())
    }

    async fn run_scheduler(
        &mut self,
        scheduler: &SchedulerConfig,
        entry: &SchedulerEntry,
        congestion_controls: &[ResourceSpec],
    ) -> Result<()> {
        for cc in congestion_controls {
            let mut controller = ResourceController::new(*cc, self.client, self.server);
            with_resource_active(&mut controller, self.run_file_sizes(scheduler, entry, cc.name)).await?;
        }
        Ok(())
    }

    async fn run_file_sizes(
        &mut self,
        scheduler: &SchedulerConfig,
        entry: &SchedulerEntry,
        congestion_control: &str,
    ) -> Result<()> {
        let test = self.config.test.clone();
        let retry_interval = Duration::from_secs(test.retry_interval_secs);

        for file_size in &test.file_sizes {
            let key = ExperimentKey::new(&scheduler.name, congestion_control, file_size)?;
            if self.store.is_completed(&key) {
                info!("Skipping test for {}, checkpointed", key);
                self.skipped += 1;
                continue;
            }

            info!("Starting test for {}", key);
            let launch = ServerLaunch::new(entry.server, &test, &scheduler.params);
            let mut server = TestServer::new(self.server, launch);
            let client = TransferClient::new(self.client, self.server, &test);

            let samples = with_resource_active(&mut server, async {
                client
                    .run_test(file_size, test.max_retries, retry_interval)
                    .await
                    .with_context(|| format!("Test failed for {}", key))
            })
            .await?;

            if samples.is_empty() {
                info!("No throughput samples reported for {}", key);
            }
            self.store.record(key, samples)?;
            self.completed += 1;
        }

        Ok(())
    }
}

/// Writes `<results_dir>/<name>/<YYYYmmdd-HHMMSS>/summary.json`.
pub fn write_summary(results_dir: &Path, name: &str, report: &CampaignReport) -> Result<PathBuf> {
    let run_dir = results_dir
        .join(name)
        .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

    let path = run_dir.join("summary.json");
    let contents = serde_json::to_string_pretty(report).context("Failed to serialize summary")?;
    std::fs::write(&path, contents).context("Failed to write summary file")?;
    Ok(path)
}
