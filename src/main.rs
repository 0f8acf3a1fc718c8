use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use remotemount::{
    start_mount, MountConfig, MountRegistry, MountRequest, MountState, MountStatus, Started,
    TaskObserver,
};

#[derive(Parser)]
#[command(name = "remotemount")]
#[command(about = "Mount a file or directory served by a remote agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a remote source and serve it until it is unmounted
    Mount {
        /// Agent address: a Unix socket path or host:port
        #[arg(long)]
        agent: String,

        /// Remote file or directory to mount
        source: String,

        /// Mount point (generated under the runtime directory if omitted)
        #[arg(long)]
        mountpoint: Option<PathBuf>,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        /// Unmount after this many idle minutes (0 = never)
        #[arg(long)]
        idle_minutes: Option<u32>,

        /// JSON settings file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Command to open the mounted path with once ready
        #[arg(long)]
        open_with: Option<String>,

        /// Server name used to recognize repeated mounts
        #[arg(long, default_value = "local")]
        server: String,

        /// Directory for generated mount points
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
    },

    /// Print the effective settings as JSON
    Config {
        /// JSON settings file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Prints status changes for the terminal user.
struct PrintObserver;

impl TaskObserver for PrintObserver {
    fn status_changed(&self, status: &MountStatus) {
        if status.state != MountState::Starting {
            eprintln!(
                "{} ({} open, {} bytes sent, {} received)",
                status.text, status.users, status.sent, status.received
            );
        }
    }

    fn failed(&self, message: &str) {
        eprintln!("Error: {}", message);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MountConfig> {
    match path {
        Some(path) => MountConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e)),
        None => Ok(MountConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Mount {
            agent,
            source,
            mountpoint,
            read_only,
            idle_minutes,
            config,
            open_with,
            server,
            runtime_dir,
        } => {
            let mut config = load_config(config.as_ref())?;
            config.read_only |= read_only;
            if let Some(minutes) = idle_minutes {
                config.idle_minutes = minutes;
            }
            if open_with.is_some() {
                config.open_with = open_with;
            }

            let registry = Arc::new(MountRegistry::new(
                runtime_dir.unwrap_or_else(MountRegistry::default_runtime_dir),
            ));
            let request = MountRequest {
                server,
                source,
                mountpoint,
                config,
            };

            let started = if agent.contains('/') || !agent.contains(':') {
                let stream = UnixStream::connect(&agent)
                    .map_err(|e| anyhow::anyhow!("Failed to connect to agent {}: {}", agent, e))?;
                start_mount(registry, stream, request, Box::new(PrintObserver))?
            } else {
                let stream = TcpStream::connect(&agent)
                    .map_err(|e| anyhow::anyhow!("Failed to connect to agent {}: {}", agent, e))?;
                stream.set_nodelay(true)?;
                start_mount(registry, stream, request, Box::new(PrintObserver))?
            };

            match started {
                Started::Reused(path) => println!("Already mounted at {:?}", path),
                Started::Spawned(handle) => {
                    println!("Mounting at {:?}", handle.mountpoint);
                    handle.join();
                }
            }
        }

        Commands::Config { config } => {
            let config = load_config(config.as_ref())?;
            match serde_json::to_string_pretty(&config) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
    }

    Ok(())
}
