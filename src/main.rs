use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netlease::{
    Config, DhcpServer, DisabledProbe, Handler, IcmpProbe, JsonDeviceStore, JsonLeaseStore,
    LeaseQuery, LeaseStore, LivenessProbe, MacAddress, Result, ServerConfig,
};

#[derive(Parser)]
#[command(name = "netlease")]
#[command(author, version, about = "A DHCP lease server for relayed networks", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "server.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 until interrupted.
    Run,
    /// Parse and validate the DHCP configuration file.
    CheckConfig,
    /// Print runtime settings and the parsed topology.
    ShowConfig,
    /// Print persisted leases.
    ListLeases {
        #[arg(long)]
        network: Option<String>,
        #[arg(long)]
        mac: Option<MacAddress>,
    },
    /// Print per-pool lease counts.
    PoolStats,
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(
            target: "netlease::panic",
            location = %location,
            message = %message,
            "Panic while serving"
        );
        error!(target: "netlease::panic", "Stack trace:\n{}", backtrace);
    }));
}

async fn build_handler(settings: &ServerConfig, config: Config) -> Result<Arc<Handler>> {
    let leases = Arc::new(JsonLeaseStore::open(&settings.leases_file).await?);
    let devices = Arc::new(JsonDeviceStore::open(&settings.devices_file).await?);
    let probe: Arc<dyn LivenessProbe> = if settings.probe_enabled() {
        Arc::new(IcmpProbe::new(settings.probe_timeout()))
    } else {
        Arc::new(DisabledProbe)
    };

    let handler =
        Handler::new(Arc::new(config), leases, devices, probe).readonly(settings.readonly);
    let handler = Arc::new(handler);
    handler.load_leases().await?;
    Ok(handler)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();
    install_panic_hook();

    let settings = ServerConfig::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with settings: {:?}", cli.config);
            let config = Config::parse_file(&settings.dhcp_config)?;
            let handler = build_handler(&settings, config).await?;
            if settings.readonly {
                info!("Read-only mode: requests are processed but never answered");
            }
            let server = DhcpServer::new(handler, &settings)?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            }
        }
        Commands::CheckConfig => {
            let config = Config::parse_file(&settings.dhcp_config)?;
            println!(
                "{}: OK ({} network(s), {} pool(s))",
                settings.dhcp_config,
                config.networks.len(),
                config.pools().count()
            );
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!();
            print!("{}", Config::parse_file(&settings.dhcp_config)?);
            Ok(())
        }
        Commands::ListLeases { network, mac } => {
            let store = JsonLeaseStore::open(&settings.leases_file).await?;
            let mut query = LeaseQuery::default();
            if let Some(network) = network {
                query = query.network(network);
            }
            if let Some(mac) = mac {
                query = query.mac(mac);
            }
            let leases = store.search_leases(&query).await?;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<16} {:<18} {:<12} {:<24} {:<10} {}",
                    "IP Address", "MAC", "Network", "Expires At", "Remaining", "Hostname"
                );
                println!("{}", "-".repeat(96));

                for lease in leases {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if lease.is_abandoned {
                        "abandoned".to_string()
                    } else if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };
                    let mac = lease.mac.map(|mac| mac.to_string()).unwrap_or_default();

                    println!(
                        "{:<16} {:<18} {:<12} {:<24} {:<10} {}",
                        lease.ip,
                        mac,
                        lease.network,
                        lease.end.format("%Y-%m-%d %H:%M:%S UTC"),
                        remaining_str,
                        lease.hostname.as_deref().unwrap_or("")
                    );
                }
            }

            Ok(())
        }
        Commands::PoolStats => {
            let config = Config::parse_file(&settings.dhcp_config)?;
            let leases = Arc::new(JsonLeaseStore::open(&settings.leases_file).await?);
            let handler = Handler::new(
                Arc::new(config),
                leases,
                Arc::new(JsonDeviceStore::in_memory([])),
                Arc::new(DisabledProbe),
            );
            handler.load_leases().await?;

            println!(
                "{:<12} {:<34} {:<5} {:>7} {:>7} {:>7} {:>9} {:>7}",
                "Network", "Range", "Reg", "Total", "Active", "Claimed", "Abandoned", "Free"
            );
            println!("{}", "-".repeat(96));
            for stats in handler.pool_stats().await {
                println!(
                    "{:<12} {:<34} {:<5} {:>7} {:>7} {:>7} {:>9} {:>7}",
                    stats.network,
                    format!("{} - {}", stats.range_start, stats.range_end),
                    if stats.registered { "yes" } else { "no" },
                    stats.total,
                    stats.active,
                    stats.claimed,
                    stats.abandoned,
                    stats.free
                );
            }
            Ok(())
        }
    }
}
