//! Test subjects: the transfer server and the measuring client.
//!
//! One server lifecycle wraps each measured transfer:
//!
//! ```text
//! Stopped ──enter()──► Starting ──launched + settled──► Running
//!    ▲                                                     │
//!    └──────────────── Stopping ◄──────exit()──────────────┘
//! ```
//!
//! The client runs the transfer synchronously on the client host and reads
//! the throughput samples from the structured block the payload prints:
//!
//! ```text
//! JSON_OUTPUT_START
//! { "iterations": 3, "throughputs": [..], "average_throughput": .. }
//! JSON_OUTPUT_END
//! ```

pub mod client;
pub mod payload;
pub mod server;
pub mod size;

pub use client::{TransferClient, parse_output};
pub use server::{ServerLaunch, ServerState, TestServer};
pub use size::{FileSize, SizeError};

use serde::{Deserialize, Serialize};

pub const OUTPUT_START: &str = "JSON_OUTPUT_START";
pub const OUTPUT_END: &str = "JSON_OUTPUT_END";

/// The structured result block printed by every client payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferReport {
    pub iterations: u32,
    /// MB/s per iteration.
    pub throughputs: Vec<f64>,
    pub average_throughput: f64,
}

impl TransferReport {
    pub fn from_throughputs(throughputs: Vec<f64>) -> Self {
        let average_throughput = if throughputs.is_empty() {
            0.0
        } else {
            throughputs.iter().sum::<f64>() / throughputs.len() as f64
        };
        Self {
            iterations: throughputs.len() as u32,
            throughputs,
            average_throughput,
        }
    }

    /// Renders the block between its markers.
    pub fn to_block(&self) -> serde_json::Result<String> {
        Ok(format!(
            "{}\n{}\n{}",
            OUTPUT_START,
            serde_json::to_string_pretty(self)?,
            OUTPUT_END
        ))
    }
}
