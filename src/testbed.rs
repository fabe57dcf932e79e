//! Host pair construction and system-wide setup.
//!
//! The testbed turns the `[topology]` section into a client and a server
//! [`Host`], prepares their storage roots, and toggles MPTCP on both.
//! Building the network itself (namespaces, links, cabling) happens outside
//! this tool.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::config::TopologyConfig;
use crate::host::local::LocalHost;
use crate::host::ssh::SshHost;
use crate::host::{Host, HostResult};

/// Sets `net.mptcp.mptcp_enabled` on every host.
pub async fn set_mptcp<H: Host + ?Sized>(hosts: [&H; 2], enabled: bool) -> HostResult<()> {
    let cmd = format!("sudo sysctl -w net.mptcp.mptcp_enabled={}", u8::from(enabled));
    for host in hosts {
        host.run_sync(&cmd).await?;
    }
    info!("MPTCP {} on all hosts", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

pub enum Testbed {
    Local {
        client: LocalHost,
        server: LocalHost,
    },
    Ssh {
        client: SshHost,
        server: SshHost,
        uploads: [Vec<PathBuf>; 2],
    },
}

impl Testbed {
    pub fn from_config(topology: &TopologyConfig) -> Self {
        match topology.clone() {
            TopologyConfig::Local { client, server } => Testbed::Local {
                client: LocalHost::new(client),
                server: LocalHost::new(server),
            },
            TopologyConfig::Ssh { client, server } => {
                let uploads = [client.upload_dirs.clone(), server.upload_dirs.clone()];
                Testbed::Ssh {
                    client: SshHost::new(client),
                    server: SshHost::new(server),
                    uploads,
                }
            }
        }
    }

    pub fn client(&self) -> &dyn Host {
        match self {
            Testbed::Local { client, .. } => client as &dyn Host,
            Testbed::Ssh { client, .. } => client as &dyn Host,
        }
    }

    pub fn server(&self) -> &dyn Host {
        match self {
            Testbed::Local { server, .. } => server as &dyn Host,
            Testbed::Ssh { server, .. } => server as &dyn Host,
        }
    }

    /// Creates storage roots and copies configured directories to remote hosts.
    pub async fn prepare(&self) -> Result<()> {
        for host in [self.client(), self.server()] {
            let root = shell_words::quote(&host.storage_root().to_string_lossy()).into_owned();
            host.run_sync(&format!("mkdir -p {}", root))
                .await
                .with_context(|| format!("Failed to create storage root on {}", host.name()))?;
        }

        if let Testbed::Ssh {
            client,
            server,
            uploads,
        } = self
        {
            for (host, dirs) in [client, server].into_iter().zip(uploads) {
                for dir in dirs {
                    if !dir.is_dir() {
                        bail!("Upload directory {} does not exist", dir.display());
                    }
                    info!("Transferring {} to {}", dir.display(), host.name());
                    host.upload(dir, host.storage_root())
                        .await
                        .with_context(|| format!("Failed to upload {}", dir.display()))?;
                }
            }
        }

        Ok(())
    }

    /// Releases transport resources held for the hosts.
    pub async fn teardown(self) {
        match self {
            Testbed::Local { .. } => {}
            Testbed::Ssh { client, server, .. } => {
                client.close().await;
                server.close().await;
            }
        }
        info!("Testbed torn down");
    }
}
