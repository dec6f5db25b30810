//! Triangles - chained screens passing triangles to each other
//!
//! Runs a headless screen, scans for peers or prints configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use triangles::config::{self, Config, DiscoveryBackend};
use triangles::discovery::{
    platform_attributes, DisabledDiscovery, Discovery, DiscoveryEvent, MdnsDiscovery,
    PeerAdvertisement,
};
use triangles::protocol::{self, SERVICE_INTERFACE};
use triangles::scene::Scene;
use triangles::{NeighborStatus, NetworkManager};

/// Triangles - screens that pass triangles to their neighbors
#[derive(Parser)]
#[command(name = "triangles")]
#[command(version = "0.1.0")]
#[command(about = "Chain screens left to right and pass triangles between them", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a headless screen
    Run {
        /// Port to listen on for invitations
        #[arg(short, long)]
        port: Option<u16>,

        /// Name to advertise
        #[arg(short, long)]
        name: Option<String>,

        /// Accept every invitation
        #[arg(long)]
        auto_accept: bool,

        /// Only wait for invitations, never look for a right neighbor
        #[arg(long)]
        no_seek: bool,
    },

    /// Discover screens on the network
    Discover {
        /// How long to scan (seconds)
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            port,
            name,
            auto_accept,
            no_seek,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.network.port = port;
            }
            if let Some(name) = name {
                config.general.name = name;
            }
            config.scene.auto_accept |= auto_accept;
            config.network.seek_neighbors &= !no_seek;
            run_screen(config).await?;
        }
        Commands::Discover { timeout, json } => {
            run_discovery(&config, timeout, json).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info();
        }
    }

    Ok(())
}

fn make_discovery(backend: DiscoveryBackend) -> anyhow::Result<Arc<dyn Discovery>> {
    let discovery: Arc<dyn Discovery> = match backend {
        DiscoveryBackend::Mdns => Arc::new(MdnsDiscovery::new()?),
        DiscoveryBackend::Disabled => Arc::new(DisabledDiscovery),
    };
    Ok(discovery)
}

/// Run a headless screen until Ctrl+C
async fn run_screen(config: Config) -> anyhow::Result<()> {
    let ctx = config.peer_context();
    let net_config = config.network.to_network_config()?;
    let discovery = make_discovery(config.network.discovery)?;

    tracing::info!("Starting screen '{}' ({})", ctx.name, ctx.instance_id);

    let (scene_tx, scene_rx) = mpsc::unbounded_channel();
    let (manager, channels) = NetworkManager::start(net_config, ctx, discovery, scene_tx);
    let mut status = channels.status.clone();

    let scene_shutdown = CancellationToken::new();
    let mut scene = tokio::spawn(Scene::new().run(
        channels,
        scene_rx,
        config.scene.clone(),
        scene_shutdown.clone(),
    ));

    println!("\n========================================");
    println!("  Triangles Screen Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Auto-accept: {}", config.scene.auto_accept);
    println!("  Seeking neighbors: {}", config.network.seek_neighbors);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    // Main event loop
    let finished = loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break None;
                }
                print_status(&status.borrow_and_update());
            }
            result = &mut scene => {
                break Some(result);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break None;
            }
        }
    };

    // The scene keeps running while the links drain into it.
    manager.shutdown().await?;
    scene_shutdown.cancel();
    let result = match finished {
        Some(result) => result,
        None => scene.await,
    };
    let scene = result??;

    tracing::info!("Screen stopped with {} triangles on screen", scene.triangles().len());
    Ok(())
}

fn print_status(status: &NeighborStatus) {
    let listen = status
        .listen_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "[{}] left: {}  right: {}  advertising: {}  searching: {}",
        listen,
        status.left.as_deref().unwrap_or("-"),
        status.right.as_deref().unwrap_or("-"),
        status.advertising,
        status.searching,
    );
}

/// Scan for screens and print what answers
async fn run_discovery(config: &Config, timeout_secs: u64, json: bool) -> anyhow::Result<()> {
    let discovery = make_discovery(config.network.discovery)?;
    if !json {
        println!("Scanning for screens ({} seconds)...\n", timeout_secs);
    }

    let mut scan = discovery.scan(SERVICE_INTERFACE).await?;
    let mut found: Vec<PeerAdvertisement> = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = scan.recv() => match event {
                Some(DiscoveryEvent::Found(advert)) => {
                    if !json {
                        println!("+ {} ({}) at {:?}", advert.name, advert.instance_id, advert.addresses);
                    }
                    found.retain(|a| a.instance_id != advert.instance_id);
                    found.push(advert);
                }
                Some(DiscoveryEvent::Lost(id)) => {
                    if !json {
                        println!("- {}", id);
                    }
                    found.retain(|a| a.instance_id != id);
                }
                None => break,
            },
            _ = &mut deadline => break,
        }
    }
    drop(scan);

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        println!("\nDiscovery complete: {} screen(s) found.", found.len());
    }
    Ok(())
}

/// Print system information
fn print_system_info() {
    println!("Triangles System Information");
    println!("============================\n");

    for (key, value) in platform_attributes() {
        println!("{}: {}", key, value);
    }
    println!("Interface: {}", SERVICE_INTERFACE);
    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {} (0 = any free port)", protocol::DEFAULT_PORT);
}
