//! mptcp-bench: resumable MPTCP experiment campaigns.
//!
//! A campaign sweeps every combination of MPTCP scheduler, TCP congestion
//! control and transfer size over a client/server host pair, one test at a
//! time, and checkpoints each measurement so an interrupted campaign picks up
//! where it stopped.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Host**: Run commands locally, in a network namespace, or over SSH
//! - **Resource**: Load, activate and unload schedulers and congestion controls
//! - **Subject**: The test server and client that measure transfer throughput
//! - **Checkpoint**: Persist results and decide which tests can be skipped
//! - **Campaign**: Drive the nested sweep
//!
//! # Example
//!
//! ```no_run
//! use mptcp_bench::campaign::Campaign;
//! use mptcp_bench::config::load_config;
//! use mptcp_bench::testbed::Testbed;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("campaign.toml"))?;
//!     let testbed = Testbed::from_config(&config.topology);
//!     testbed.prepare().await?;
//!
//!     let report = Campaign::new(config, testbed.client(), testbed.server())
//!         .run()
//!         .await?;
//!     println!("{} tests completed", report.completed);
//!
//!     testbed.teardown().await;
//!     Ok(())
//! }
//! ```

pub mod campaign;
pub mod checkpoint;
pub mod config;
pub mod host;
pub mod resource;
pub mod subject;
pub mod testbed;

// Re-export commonly used types
pub use campaign::{Campaign, CampaignReport};
pub use checkpoint::{CheckpointStore, ExperimentKey};
pub use config::{Config, load_config};
pub use host::{Host, HostError};
