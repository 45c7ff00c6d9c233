//! Skein Daemon - serves a command file tree over TCP.
//!
//! Provides:
//! - A command tree of environments and commands run by the host shell
//! - One multiplexed connection per client, one RPC stream per request
//! - Per-operation counters in /Ctl

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::select;
use tokio::signal;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use skein_cmdfs::{CmdFsConfig, Tree};
use skein_net::{Mux, MuxConfig, TcpListener};
use skein_proto::{Codec, CodecConfig, MAX_MSG_SIZE};
use skein_srv::Server;

/// Default port the daemon listens on.
const DEFAULT_PORT: u16 = 7020;

/// Skein daemon service.
#[derive(Parser)]
#[command(name = "skeind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.skein/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the command tree (default)
    Run {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Print the effective configuration
    Config,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// Listen address
    listen_addr: SocketAddr,
    /// Largest message accepted or sent
    max_msg_size: usize,
    /// Queue size of each multiplexed stream
    nbuf: usize,
    /// Command tree settings
    cmdfs: CmdFsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_msg_size: MAX_MSG_SIZE,
            nbuf: MuxConfig::default().nbuf,
            cmdfs: CmdFsConfig::default(),
        }
    }
}

impl DaemonConfig {
    fn codec(&self) -> Codec {
        Codec::new(CodecConfig {
            max_msg_size: self.max_msg_size,
        })
    }

    fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            nbuf: self.nbuf,
            ..MuxConfig::new("skeind")
        }
    }
}

/// Load configuration from TOML file.
fn load_config(path: &Path) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    parse_config(&content).with_context(|| format!("Bad config file {:?}", path))
}

fn parse_config(content: &str) -> Result<DaemonConfig> {
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    let mut config = DaemonConfig::default();

    // Parse [server] section
    if let Some(server) = toml.get("server") {
        if let Some(listen) = server.get("listen").and_then(|v| v.as_str()) {
            config.listen_addr = listen.parse().context("Invalid listen address")?;
        }
    }

    // Parse [wire] section
    if let Some(wire) = toml.get("wire") {
        if let Some(size) = wire.get("max_msg_size").and_then(|v| v.as_integer()) {
            config.max_msg_size = usize::try_from(size).context("Invalid max_msg_size")?;
        }
        if let Some(nbuf) = wire.get("nbuf").and_then(|v| v.as_integer()) {
            config.nbuf = usize::try_from(nbuf).context("Invalid nbuf")?;
        }
    }

    // The [cmdfs] section maps onto the tree configuration
    if let Some(cmdfs) = toml.get("cmdfs") {
        config.cmdfs = cmdfs
            .clone()
            .try_into()
            .context("Invalid [cmdfs] section")?;
    }

    Ok(config)
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    // Load configuration
    let mut config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run { listen: None }) {
        Commands::Run { listen } => {
            // Override listen address if specified
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }
            run(config).await?;
        }

        Commands::Config => {
            println!("[server]");
            println!("listen = \"{}\"", config.listen_addr);
            println!();
            println!("[wire]");
            println!("max_msg_size = {}", config.max_msg_size);
            println!("nbuf = {}", config.nbuf);
            println!();
            println!("[cmdfs]");
            print!(
                "{}",
                toml::to_string(&config.cmdfs).context("Failed to print [cmdfs] section")?
            );
        }
    }

    Ok(())
}

/// Serves the tree until Ctrl+C.
async fn run(config: DaemonConfig) -> Result<()> {
    info!("Starting skein daemon");
    info!("Listen address: {}", config.listen_addr);

    let listener = TcpListener::bind(&config.listen_addr.to_string(), config.mux_config(), config.codec())
        .await
        .context("Failed to bind listen address")?;
    let tree = Tree::new(config.cmdfs.clone());
    let server = Server::new(tree);

    println!("skein daemon running");
    println!("  Tree: {}", server.tree().name());
    println!("  Listen: {}", listener.local_addr()?);
    println!();
    println!("Press Ctrl+C to stop");

    let mut clients: Vec<Mux> = Vec::new();
    loop {
        select! {
            res = listener.accept() => {
                match res {
                    Ok((mux, incoming, peer)) => {
                        info!("Client connected: {}", peer);
                        clients.retain(|m| !m.is_closed());
                        clients.push(mux);
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.serve(incoming).await;
                            debug!("Client gone: {}", peer);
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            }

            res = signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
        }
    }

    info!("Shutting down, closing {} connections", clients.len());
    for mux in &clients {
        mux.close();
    }
    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = PathBuf::from("~/.skein/config.toml");
        let expanded = expand_tilde(&path);

        if let Some(home) = dirs::home_dir() {
            assert!(expanded.starts_with(&home));
            assert!(expanded.ends_with(".skein/config.toml"));
        }
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_msg_size, 64 * 1024);
        assert_eq!(config.nbuf, 1024);
        assert_eq!(config.cmdfs.shell, "/bin/sh");
    }

    #[test]
    fn test_parse_config() {
        let config = parse_config(
            r#"
            [server]
            listen = "0.0.0.0:7777"

            [wire]
            max_msg_size = 8192
            nbuf = 64

            [cmdfs]
            shell = "/bin/bash"
            restart_grace_ms = 500
            owner = "glenda"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 7777);
        assert_eq!(config.max_msg_size, 8192);
        assert_eq!(config.mux_config().nbuf, 64);
        assert_eq!(config.cmdfs.shell, "/bin/bash");
        assert_eq!(config.cmdfs.restart_grace_ms, 500);
        assert_eq!(config.cmdfs.owner, "glenda");
        assert_eq!(config.cmdfs.shell_args, vec!["-c".to_string()]);
    }

    #[test]
    fn test_parse_config_errors() {
        assert!(parse_config("[server]\nlisten = \"nowhere\"").is_err());
        assert!(parse_config("[wire]\nnbuf = -1").is_err());
        assert!(parse_config("[cmdfs]\nrestart_grace_ms = \"soon\"").is_err());
        assert!(parse_config("not toml at all [").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/skein/config.toml")).unwrap();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
    }
}
