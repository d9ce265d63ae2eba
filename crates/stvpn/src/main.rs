//! stvpn - SecureTunnel VPN command line
//!
//! Browses the server catalog and runs sessions against the simulated
//! transport, printing every session snapshot as it is published.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stvpn_core::{
    format_bytes, CoreConfig, CoreType, ServerDescriptor, ServerDirectory, ServerFilter,
    ServerStatus, SessionManager, SessionSnapshot, Subscription, Tier,
};
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Length of the premium plan granted by `--premium`
const DEMO_PREMIUM_PERIOD: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Parser)]
#[command(name = "stvpn")]
#[command(version)]
#[command(about = "SecureTunnel VPN session manager")]
struct Args {
    /// Config file (.toml or .json); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the server catalog
    Servers {
        /// Only servers of this tier (free, premium)
        #[arg(long)]
        tier: Option<Tier>,

        /// Only servers with this status (online, offline, maintenance)
        #[arg(long)]
        status: Option<ServerStatus>,

        /// Only servers running this core (xray, v2fly)
        #[arg(long)]
        core: Option<CoreType>,

        /// Case-insensitive match on name, location or country
        #[arg(long)]
        search: Option<String>,

        /// Group the listing by country
        #[arg(long)]
        by_country: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run a session on the simulated transport
    Connect {
        /// Server id to connect to
        #[arg(required_unless_present = "quick", conflicts_with = "quick")]
        server_id: Option<String>,

        /// Pick the fastest server the subscription allows
        #[arg(long)]
        quick: bool,

        /// Act as a premium subscriber
        #[arg(long)]
        premium: bool,

        /// Seconds to stay connected before disconnecting
        #[arg(short, long, default_value = "15")]
        duration: u64,

        /// Sever the tunnel after this many seconds to exercise reconnects
        #[arg(long, value_name = "SECS")]
        lose_after: Option<u64>,

        /// Print snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Write the default configuration to a file
    InitConfig {
        /// Destination; the extension picks TOML or JSON
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match args.command {
        Command::Servers {
            tier,
            status,
            core,
            search,
            by_country,
            json,
        } => {
            let config = load_config(args.config.as_deref())?;
            let directory = ServerDirectory::new(config.servers).context("Invalid server catalog")?;
            let filter = ServerFilter {
                tier,
                status,
                core_type: core,
                search,
            };
            list_servers(&directory, &filter, by_country, json)
        }
        Command::Connect {
            server_id,
            quick,
            premium,
            duration,
            lose_after,
            json,
        } => {
            let config = load_config(args.config.as_deref())?;
            let subscription = if premium {
                Subscription::premium_for(DEMO_PREMIUM_PERIOD)
            } else {
                Subscription::free()
            };
            let target = if quick { None } else { server_id };
            run_session(
                config,
                subscription,
                target,
                Duration::from_secs(duration),
                lose_after.map(Duration::from_secs),
                json,
            )
            .await
        }
        Command::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            CoreConfig::default()
                .write_to(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote default config to {}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(path) => CoreConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(CoreConfig::default()),
    }
}

fn list_servers(
    directory: &ServerDirectory,
    filter: &ServerFilter,
    by_country: bool,
    json: bool,
) -> Result<()> {
    let servers = directory.filter(filter);

    if by_country {
        let groups: Vec<_> = directory
            .by_country()
            .into_iter()
            .filter_map(|mut group| {
                group.servers.retain(|s| filter.matches(s));
                (!group.servers.is_empty()).then_some(group)
            })
            .collect();

        if json {
            println!("{}", serde_json::to_string_pretty(&groups)?);
            return Ok(());
        }
        for group in groups {
            println!("{} ({})", group.country, group.country_code.to_uppercase());
            for server in &group.servers {
                println!("  {}", server_row(server));
            }
        }
    } else {
        if json {
            println!("{}", serde_json::to_string_pretty(&servers)?);
            return Ok(());
        }
        println!(
            "{:<4} {:<16} {:<14} {:<8} {:<12} {:<6} {:>6} {:>5}",
            "ID", "NAME", "LOCATION", "TIER", "STATUS", "CORE", "PING", "LOAD"
        );
        for server in &servers {
            println!("{}", server_row(server));
        }
    }

    let counts = directory.counts();
    println!(
        "\n{} shown | {} total, {} online, {} free, {} premium",
        servers.len(),
        counts.total,
        counts.online,
        counts.free,
        counts.premium
    );
    Ok(())
}

fn server_row(server: &ServerDescriptor) -> String {
    let ping = server
        .ping
        .map(|p| format!("{}ms", p))
        .unwrap_or_else(|| "-".into());
    let load = server
        .load
        .map(|l| format!("{}%", l))
        .unwrap_or_else(|| "-".into());
    format!(
        "{:<4} {:<16} {:<14} {:<8} {:<12} {:<6} {:>6} {:>5}",
        server.id,
        server.name,
        server.location,
        server.tier.as_str(),
        server.status.as_str(),
        server.core_type.as_str(),
        ping,
        load
    )
}

async fn run_session(
    config: CoreConfig,
    subscription: Subscription,
    target: Option<String>,
    duration: Duration,
    lose_after: Option<Duration>,
    json: bool,
) -> Result<()> {
    let directory = Arc::new(ServerDirectory::new(config.servers.clone()).context("Invalid server catalog")?);
    let transport = Arc::new(config.transport.simulated());
    let manager = SessionManager::spawn(
        directory,
        Arc::new(subscription),
        transport.clone(),
        config.session_options(),
    );
    let mut updates = manager.subscribe();

    let result = match target {
        Some(id) => manager.connect(&id).await,
        None => manager.quick_connect().await,
    };
    let server = match result {
        Ok(server) => server,
        Err(err) => {
            print_snapshot(&manager.snapshot(), json)?;
            manager.shutdown().await;
            bail!("Connect refused: {}", err);
        }
    };
    info!("Session with {} for {:?}", server, duration);

    if let Some(delay) = lose_after {
        let transport = transport.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let cut = transport.sever_all();
            warn!("Severed {} simulated tunnel(s)", cut);
        });
    }

    // Print until the deadline, or until the session falls back to idle
    let deadline = time::sleep(duration);
    tokio::pin!(deadline);
    let mut active = false;
    let mut ended = false;
    while !ended {
        tokio::select! {
            _ = &mut deadline => break,
            snapshot = updates.recv() => {
                let Some(snapshot) = snapshot else { break };
                print_snapshot(&snapshot, json)?;
                if !snapshot.phase.is_idle() {
                    active = true;
                } else if active {
                    ended = true;
                }
            }
        }
    }

    if !ended {
        match manager.disconnect().await {
            Ok(()) => {
                if let Some(snapshot) = updates.wait_for(|s| s.phase.is_idle()).await {
                    print_snapshot(&snapshot, json)?;
                }
            }
            Err(err) => warn!("Disconnect: {}", err),
        }
    }

    let last = manager.snapshot();
    manager.shutdown().await;

    if let Some(err) = last.last_error {
        bail!("Session ended with error: {}", err);
    }
    info!(
        "Session closed ({} tunnel(s) opened)",
        transport.open_calls()
    );
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        println!("{}", snapshot.summary());
        if let Some((up, down)) = snapshot.phase.traffic() {
            tracing::debug!("Traffic total: {}", format_bytes(up.saturating_add(down)));
        }
    }
    Ok(())
}
