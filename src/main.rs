//! mptcp-bench CLI - resumable MPTCP experiment campaigns.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mptcp_bench::campaign::Campaign;
use mptcp_bench::checkpoint::{self, CheckpointStore};
use mptcp_bench::config::{self, Config, SubjectConfig, TopologyConfig};
use mptcp_bench::link_test::{self, LinkTester};
use mptcp_bench::resource::catalog;
use mptcp_bench::subject::payload::{self, FetchOptions, PayloadServer};
use mptcp_bench::testbed::Testbed;

#[derive(Parser)]
#[command(name = "mptcp-bench")]
#[command(about = "Resumable MPTCP scheduler and congestion-control experiments", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment campaign
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "mptcp-bench.toml")]
        config: PathBuf,
    },

    /// Measure bandwidth, RTT, jitter and loss of every client/server path
    LinkTest {
        /// Configuration file path
        #[arg(short, long, default_value = "mptcp-bench.toml")]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "mptcp-bench.toml")]
        config: PathBuf,
    },

    /// Print the results collected so far for a campaign
    Summary {
        /// Configuration file path
        #[arg(short, long, default_value = "mptcp-bench.toml")]
        config: PathBuf,
    },

    /// Native transfer payload
    #[command(subcommand)]
    Payload(PayloadCommand),
}

#[derive(Subcommand)]
enum PayloadCommand {
    /// Serve payload files over HTTP
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        ip: IpAddr,

        #[arg(long, default_value_t = payload::DEFAULT_PORT)]
        port: u16,

        /// Where generated payload files are kept
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Download a payload repeatedly and report throughput
    Fetch {
        #[arg(long)]
        server_ip: IpAddr,

        /// Local address to bind the client socket to
        #[arg(long)]
        client_bind_ip: Option<IpAddr>,

        #[arg(long, default_value_t = payload::DEFAULT_PORT)]
        server_port: u16,

        /// Payload size, e.g. 10M
        #[arg(long, default_value = "1M")]
        filesize: String,

        #[arg(long, default_value_t = 1)]
        iterations: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load(&config, cli.verbose)?;
            run_campaign(config).await
        }
        Commands::LinkTest { config } => {
            let config = load(&config, cli.verbose)?;
            run_link_test(config).await
        }
        Commands::Validate { config } => validate_config(&config),
        Commands::Summary { config } => {
            let config = load(&config, cli.verbose)?;
            show_summary(&config)
        }
        Commands::Payload(cmd) => {
            init_logging(cli.verbose, "info")?;
            run_payload(cmd).await
        }
    }
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level.
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load(path: &Path, verbose: bool) -> Result<Config> {
    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    init_logging(verbose, &config.logging.level)?;
    config::validate(&config)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

async fn run_campaign(config: Config) -> Result<()> {
    let testbed = Testbed::from_config(&config.topology);
    if let Err(e) = testbed.prepare().await {
        testbed.teardown().await;
        return Err(e);
    }

    let result = {
        let mut campaign = Campaign::new(config, testbed.client(), testbed.server());
        campaign.run().await
    };
    testbed.teardown().await;

    let report = result?;
    println!(
        "Campaign '{}' finished: {} tests run, {} resumed from checkpoint",
        report.name, report.completed, report.skipped
    );
    Ok(())
}

async fn run_link_test(config: Config) -> Result<()> {
    let testbed = Testbed::from_config(&config.topology);
    let duration = Duration::from_secs(config.test.link_test_duration_secs);

    let result = LinkTester::new(testbed.client(), testbed.server(), duration)
        .run()
        .await;
    testbed.teardown().await;

    let results = result?;
    println!("{}", link_test::render_results(&results));
    let path = link_test::write_results(&config.results.dir, &config.name, &results)?;
    println!("Link test results written to {}", path.display());
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path).and_then(|c| {
        config::validate(&c)?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Campaign: {}", config.name);
    println!("  Network environment: {}", config.network_env);

    let topology = match &config.topology {
        TopologyConfig::Local { .. } => "local",
        TopologyConfig::Ssh { .. } => "ssh",
    };
    println!("  Topology: {}", topology);

    let subject = match &config.test.subject {
        SubjectConfig::Python => "python".to_string(),
        SubjectConfig::Native { binary } => format!("native ({})", binary),
    };
    println!("  Subject: {}", subject);

    let schedulers: Vec<&str> = config.schedulers.iter().map(|s| s.name.as_str()).collect();
    println!("  Schedulers: {}", schedulers.join(", "));
    println!("  Congestion controls: {}", config.congestion_controls.join(", "));
    println!("  File sizes: {}", config.test.file_sizes.join(", "));
    println!("  Iterations: {}", config.test.num_iterations);
    println!(
        "  Tests: {}",
        schedulers.len() * config.congestion_controls.len() * config.test.file_sizes.len()
    );
    println!("  Checkpoint: {}", config.test.checkpoint);

    let unused: Vec<&str> = catalog::scheduler_names()
        .filter(|name| !schedulers.contains(name))
        .collect();
    if !unused.is_empty() {
        println!("  Other available schedulers: {}", unused.join(", "));
    }

    Ok(())
}

fn show_summary(config: &Config) -> Result<()> {
    let path = CheckpointStore::default_path(config);
    if !path.exists() {
        println!("No results recorded yet ({} does not exist)", path.display());
        return Ok(());
    }

    let (fingerprint, results) = CheckpointStore::read_unchecked(&path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;

    let current = checkpoint::CampaignFingerprint::from_config(config);
    if let Err(e) = current.check_compatibility(&fingerprint) {
        println!("Warning: checkpoint belongs to a different configuration ({})", e);
    }

    println!("Campaign: {} ({} combinations recorded)", fingerprint.name, results.len());
    println!("{}", checkpoint::render_table(&checkpoint::summarize(&results)));
    Ok(())
}

async fn run_payload(cmd: PayloadCommand) -> Result<()> {
    match cmd {
        PayloadCommand::Serve {
            ip,
            port,
            cache_dir,
        } => {
            let cache_dir =
                cache_dir.unwrap_or_else(|| std::env::temp_dir().join("mptcp-bench-payload"));
            std::fs::create_dir_all(&cache_dir)
                .with_context(|| format!("Failed to create {}", cache_dir.display()))?;

            let server = PayloadServer::bind(SocketAddr::new(ip, port), cache_dir).await?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, stopping payload server");
                    on_signal.cancel();
                }
            });

            server.run(cancel).await
        }
        PayloadCommand::Fetch {
            server_ip,
            client_bind_ip,
            server_port,
            filesize,
            iterations,
        } => {
            let mut options = FetchOptions::new(server_ip, filesize);
            options.bind_ip = client_bind_ip;
            options.server_port = server_port;
            options.iterations = iterations;

            let report = payload::fetch(&options).await?;
            println!("{}", report.to_block()?);
            Ok(())
        }
    }
}
