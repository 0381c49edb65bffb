//! flex - container manager client and daemon
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon (foreground, or detached with -d)
//! flex daemon
//! flex daemon --tcp 0.0.0.0:8443 -d
//!
//! # Talk to it
//! flex ping
//! flex create web --distro ubuntu --release noble --arch amd64
//! flex start web
//! flex attach web -c /bin/bash
//! flex list
//! ```

use std::fs::{self, File};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flex_client::{generate_secret, relay, Client, ClientError};
use flex_core::{var_path, Config, Lifecycle, Template};
use flex_protocol::message::CREATE_FAILED;
use flexd::{Daemon, DaemonConfig, LxcRuntime};

/// flex - lightweight LXC container manager
#[derive(Parser, Debug)]
#[command(name = "flex", version, about)]
struct Args {
    /// Log progress information
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log debugging information
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (default: ~/.flex/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Named remote to talk to instead of the local daemon
    #[arg(long, global = true)]
    remote: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the daemon answers
    Ping,
    /// List containers
    List,
    /// Create a container from the download template
    Create {
        name: String,
        #[arg(long, default_value = "ubuntu")]
        distro: String,
        #[arg(long, default_value = "trusty")]
        release: String,
        #[arg(long, default_value = "amd64")]
        arch: String,
    },
    /// Run a command in a container with the local terminal attached
    Attach {
        name: String,
        #[arg(short, long, default_value = "/bin/bash")]
        command: String,
    },
    /// Start a container
    Start { name: String },
    /// Stop a container
    Stop { name: String },
    /// Reboot a container
    Reboot { name: String },
    /// Destroy a container
    Destroy { name: String },
    /// Run the daemon
    Daemon {
        /// Also listen on this TCP address
        #[arg(long)]
        tcp: Option<String>,
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        detach: bool,
    },
    /// Print the version
    Version,
}

fn main() {
    let args = Args::parse();

    if let Command::Daemon { detach: true, .. } = args.command {
        if let Err(e) = daemonize() {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let is_daemon = matches!(args.command, Command::Daemon { .. });
    let level = if args.debug {
        "debug"
    } else if args.verbose || is_daemon {
        "info"
    } else {
        "warn"
    };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!(
            "flex={level},flexd={level},flex_client={level},flex_core={level},flex_protocol={level}"
        ))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Config::load().context("Failed to load configuration"),
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    init_logging(&args)?;
    let config = load_config(args.config.as_ref())?;
    let remote = args.remote.as_deref();

    match args.command {
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Daemon { tcp, .. } => run_daemon(config, tcp).await,
        Command::Ping => {
            let client = Client::connect(&config, remote).await?;
            info!(endpoint = %client.endpoint(), "Daemon answered");
            println!("pong");
            Ok(())
        }
        Command::List => {
            let client = Client::connect(&config, remote).await?;
            for entry in client.list().await? {
                println!("{entry}");
            }
            Ok(())
        }
        Command::Create {
            name,
            distro,
            release,
            arch,
        } => {
            let client = Client::connect(&config, remote).await?;
            let template = Template::new(distro, release, arch);
            match client.create(&name, &template).await {
                Ok(()) => {
                    println!("success!");
                    Ok(())
                }
                Err(ClientError::Daemon(body)) => {
                    println!("{body}");
                    if body.trim() == CREATE_FAILED {
                        bail!("Failed to create container {name}");
                    }
                    bail!("Daemon rejected create request")
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Attach { name, command } => {
            let client = Client::connect(&config, remote).await?;
            let secret = generate_secret();
            let reply = client
                .attach(&name, &command, &secret)
                .await
                .with_context(|| format!("Failed to attach to {name}"))?;
            let stream = client.open_relay(reply, &secret).await?;
            relay::run_terminal(stream).await?;
            Ok(())
        }
        Command::Start { name } => lifecycle(&config, remote, Lifecycle::Start, &name).await,
        Command::Stop { name } => lifecycle(&config, remote, Lifecycle::Stop, &name).await,
        Command::Reboot { name } => lifecycle(&config, remote, Lifecycle::Reboot, &name).await,
        Command::Destroy { name } => lifecycle(&config, remote, Lifecycle::Destroy, &name).await,
    }
}

async fn lifecycle(config: &Config, remote: Option<&str>, op: Lifecycle, name: &str) -> Result<()> {
    let client = Client::connect(config, remote).await?;
    client
        .lifecycle(op, name)
        .await
        .with_context(|| format!("Failed to {op} {name}"))
}

async fn run_daemon(mut config: Config, tcp: Option<String>) -> Result<()> {
    if tcp.is_some() {
        config.listen_addr = tcp;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "flex daemon starting"
    );

    let runtime = Arc::new(LxcRuntime::new(&config.lxc_path, var_path(["containers"])));
    let daemon = Daemon::start(DaemonConfig::from_config(&config), runtime)
        .await
        .context("Failed to start daemon")?;

    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "Error waiting for shutdown signal");
    }
    info!("Shutdown signal received");

    daemon.stop().await.context("Daemon did not stop cleanly")?;
    info!("flex daemon stopped");
    Ok(())
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = var_path(["flexd.log"]);

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
