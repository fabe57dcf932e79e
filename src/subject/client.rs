//! Transfer client: runs one measured download and parses its report.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use super::TransferReport;
use crate::config::{SubjectConfig, TestConfig};
use crate::host::{Host, HostError, HostResult};

static REPORT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)JSON_OUTPUT_START\s*(\{.*\})\s*JSON_OUTPUT_END")
        .expect("report block pattern is valid")
});

/// Extracts the throughput samples from payload output.
///
/// Missing markers or an unparsable block yield an empty list.
pub fn parse_output(output: &str) -> Vec<f64> {
    let Some(caps) = REPORT_BLOCK.captures(output) else {
        debug!("No result block in client output");
        return Vec::new();
    };

    match serde_json::from_str::<TransferReport>(caps[1].trim()) {
        Ok(report) => report.throughputs,
        Err(e) => {
            warn!("Malformed result block: {}", e);
            Vec::new()
        }
    }
}

/// Runs transfers from the client host against the server host.
pub struct TransferClient<'h, H: Host + ?Sized> {
    client: &'h H,
    server: &'h H,
    subject: SubjectConfig,
    port: Option<u16>,
    debug: bool,
    iterations: u32,
}

impl<'h, H: Host + ?Sized> TransferClient<'h, H> {
    pub fn new(client: &'h H, server: &'h H, test: &TestConfig) -> Self {
        Self {
            client,
            server,
            subject: test.subject.clone(),
            port: test.server_port,
            debug: test.server_debug,
            iterations: test.num_iterations,
        }
    }

    pub fn command(
        &self,
        storage_root: &Path,
        server_ip: &str,
        client_ip: &str,
        file_size: &str,
    ) -> String {
        let mut cmd = match &self.subject {
            SubjectConfig::Python => {
                let script = storage_root
                    .join("clients")
                    .join("payload")
                    .join("default")
                    .join("client_payload.py");
                format!(
                    "sudo mptcpize run python3 {} --server_ip {} --client_bind_ip {}",
                    script.display(),
                    server_ip,
                    client_ip
                )
            }
            SubjectConfig::Native { binary } => format!(
                "sudo mptcpize run {} payload fetch --server-ip {} --client-bind-ip {}",
                binary, server_ip, client_ip
            ),
        };

        let native = matches!(self.subject, SubjectConfig::Native { .. });
        if let Some(port) = self.port {
            let flag = if native { "--server-port" } else { "--server_port" };
            cmd.push_str(&format!(" {} {}", flag, port));
        }
        if self.debug && !native {
            cmd.push_str(" --debug");
        }
        cmd.push_str(&format!(" --filesize {} --iterations {}", file_size, self.iterations));
        cmd
    }

    /// Runs one transfer test and returns its throughput samples (MB/s).
    ///
    /// Command failures are retried up to `max_retries` times with a fixed
    /// `retry_interval`; the last failure is returned once they run out.
    /// Transport failures are returned immediately.
    pub async fn run_test(
        &self,
        file_size: &str,
        max_retries: usize,
        retry_interval: Duration,
    ) -> HostResult<Vec<f64>> {
        let client_ip = self.client.primary_ip().await?;
        let server_ip = self.server.primary_ip().await?;
        let cmd = self.command(self.client.storage_root(), &server_ip, &client_ip, file_size);

        let mut attempt = 0;
        loop {
            match self.client.run_sync(&cmd).await {
                Ok(output) => return Ok(parse_output(&output)),
                Err(e @ HostError::CommandExecution { .. }) => {
                    error!("Attempt {}: Command failed with error: {}", attempt + 1, e);
                    if attempt == max_retries {
                        error!("All {} attempts failed", max_retries + 1);
                        return Err(e);
                    }
                    info!("Retrying in {} seconds...", retry_interval.as_secs());
                    tokio::time::sleep(retry_interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
