use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "device-forwarder")]
#[command(about = "Device-side port forwarding daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default configuration file if none exists.
    Init {
        /// Config file path (default: DEVICE_FORWARDER_CONFIG or ~/.device-forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the forwarding daemon until SIGINT or SIGTERM.
    Run {
        /// Config file path (default: DEVICE_FORWARDER_CONFIG or ~/.device-forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Control socket path (default: DEVICE_FORWARDER_SOCKET or config controller.socketPath)
        #[arg(long, short, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Ask a running daemon to forward a device port (0 picks a free port).
    Listen {
        #[arg(long, short)]
        port: u16,

        /// Control socket path (default: DEVICE_FORWARDER_SOCKET or config controller.socketPath)
        #[arg(long, short, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Ask a running daemon to stop forwarding a device port.
    Unlisten {
        #[arg(long, short)]
        port: u16,

        /// Control socket path (default: DEVICE_FORWARDER_SOCKET or config controller.socketPath)
        #[arg(long, short, value_name = "PATH")]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("device-forwarder {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, socket }) => {
            if let Err(e) = run_daemon(config, socket).await {
                log::error!("forwarder failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Listen { port, socket }) => {
            if let Err(e) = run_listen(port, socket).await {
                log::error!("listen failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Unlisten { port, socket }) => {
            if let Err(e) = run_unlisten(port, socket).await {
                log::error!("unlisten failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(forwarder::config::default_config_path);
    if forwarder::init::init_config(&path)? {
        println!("initialized configuration at {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

async fn run_daemon(config_path: Option<PathBuf>, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let (mut config, _) = forwarder::config::load_config(config_path)?;
    config.controller.socket_path =
        socket.unwrap_or_else(|| forwarder::config::resolve_socket_path(&config));

    let (trigger, shutdown) = forwarder::shutdown::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.trigger();
    });
    forwarder::forward::run_forwarder(config, shutdown).await
}

/// Socket path for host-side commands: flag, then env, then the default config.
fn control_socket(socket: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match socket {
        Some(p) => Ok(p),
        None => {
            let (config, _) = forwarder::config::load_config(None)?;
            Ok(forwarder::config::resolve_socket_path(&config))
        }
    }
}

async fn run_listen(port: u16, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let path = control_socket(socket)?;
    forwarder::host::listen(&path, port).await?;
    println!("listen request for port {} applied", port);
    Ok(())
}

async fn run_unlisten(port: u16, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let path = control_socket(socket)?;
    forwarder::host::unlisten(&path, port).await?;
    println!("port {} no longer forwarded", port);
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing listeners");
}
