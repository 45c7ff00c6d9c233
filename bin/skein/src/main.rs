//! Skein CLI - command-line client for a skein daemon.
//!
//! Provides commands for:
//! - Browsing the command tree (ls, stat, cat)
//! - Writing files, creating and removing environments and commands
//! - Running a script and following its output

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use skein_core::{channel, StreamError};
use skein_net::MuxConfig;
use skein_proto::{read_bytes, write_bytes, Codec, Dir};
use skein_srv::Client;

/// Bytes asked for by each streaming read.
const FOLLOW_COUNT: i64 = 64 * 1024;

/// Queue size between stdin and the connection.
const PUT_NBUF: usize = 16;

/// Skein command tree client.
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:7020")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a directory
    Ls {
        /// Directory path
        #[arg(default_value = "/")]
        path: String,

        /// Show every attribute
        #[arg(short, long)]
        long: bool,
    },

    /// Show the attributes of a file
    Stat {
        /// File path
        path: String,
    },

    /// Print a file
    Cat {
        /// File path
        path: String,
    },

    /// Write stdin to a file
    Put {
        /// File path
        path: String,

        /// Mode for the file; writing a command's input with a mode
        /// replaces it instead of appending
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// Create an environment or a command
    Mkdir {
        /// Directory path
        path: String,
    },

    /// Remove a file or directory
    Rm {
        /// Path to remove
        path: String,

        /// Remove directory contents too
        #[arg(short, long)]
        recursive: bool,
    },

    /// Post a signal to a command (kill, quit, intr, stack, restart)
    Sig {
        /// Command path
        path: String,

        /// Signal name
        signal: String,
    },

    /// Run a script in a new command and follow its output
    Run {
        /// Environment name, created if missing
        env: String,

        /// Command name
        cmd: String,

        /// Script text
        script: String,
    },
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

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let client = Client::dial(&cli.addr, MuxConfig::new("skein"), Codec::default())
        .await
        .with_context(|| format!("Failed to connect to {}", cli.addr))?;
    info!("Connected to {}", cli.addr);

    let res = dispatch(&client, cli.command).await;
    client.close();
    res
}

async fn dispatch(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Ls { path, long } => {
            for d in client.getdir(&path).await? {
                if long {
                    println!("{}", d);
                } else if d.is_dir() {
                    println!("{}/", d.name());
                } else {
                    println!("{}", d.name());
                }
            }
        }

        Commands::Stat { path } => {
            println!("{}", client.stat(&path).await?);
        }

        Commands::Cat { path } => {
            let mut rx = client.get(&path, 0, -1).await?;
            let mut stdout = tokio::io::stdout();
            write_bytes(&mut stdout, &mut rx)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
        }

        Commands::Put { path, mode } => {
            let mut meta = Dir::new();
            if let Some(mode) = mode {
                meta.set("mode", mode);
            }
            let n = put_stdin(client, &path, &meta).await?;
            debug!("Wrote {} bytes to {}", n, path);
        }

        Commands::Mkdir { path } => {
            client.mkdir(&path, &Dir::new()).await?;
        }

        Commands::Rm { path, recursive } => {
            client.remove(&path, recursive).await?;
        }

        Commands::Sig { path, signal } => {
            client.put_all(&format!("{}/sig", path), signal).await?;
        }

        Commands::Run { env, cmd, script } => {
            run(client, &env, &cmd, &script).await?;
        }
    }
    Ok(())
}

/// Streams stdin into `path`. Returns the bytes read from stdin.
async fn put_stdin(client: &Client, path: &str, meta: &Dir) -> Result<u64> {
    let (tx, rx) = channel::<Bytes>(PUT_NBUF);
    let feed = async move {
        let mut stdin = tokio::io::stdin();
        match read_bytes(&mut stdin, &tx).await {
            Ok(stats) => {
                tx.close();
                stats.bytes
            }
            Err(e) => {
                tx.close_with(Some(StreamError::from(e)));
                0
            }
        }
    };
    let (res, n) = tokio::join!(client.put(path, meta, 0, rx), feed);
    res.with_context(|| format!("Failed to write {}", path))?;
    Ok(n)
}

/// Creates `/<env>/<cmd>`, starts `script` in it and copies its output
/// until it exits.
async fn run(client: &Client, env: &str, cmd: &str, script: &str) -> Result<()> {
    let env_path = format!("/{}", env);
    if client.stat(&env_path).await.is_err() {
        client
            .mkdir(&env_path, &Dir::new())
            .await
            .with_context(|| format!("Failed to create {}", env_path))?;
    }
    let path = format!("{}/{}", env_path, cmd);
    client
        .mkdir(&path, &Dir::new())
        .await
        .with_context(|| format!("Failed to create {}", path))?;
    client
        .put_all(&format!("{}/cmd", path), script.to_string())
        .await
        .with_context(|| format!("Failed to start {}", path))?;
    info!("Started {}", path);

    let (out, err) = tokio::join!(
        follow(client, format!("{}/pout", path), tokio::io::stdout()),
        follow(client, format!("{}/perr", path), tokio::io::stderr()),
    );
    out?;
    err?;

    let sts = client.get_all(&format!("{}/wait", path)).await?;
    let sts = String::from_utf8_lossy(&sts);
    if sts.trim() != "success" {
        bail!("{}: {}", path, sts.trim());
    }
    Ok(())
}

/// Copies a streaming output file to `w` until the command is done.
/// Returns the bytes copied.
async fn follow<W>(client: &Client, path: String, mut w: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut off = 0u64;
    loop {
        let mut rx = client.get(&path, off, FOLLOW_COUNT).await?;
        let mut n = 0u64;
        while let Some(b) = rx.recv().await {
            w.write_all(&b).await?;
            n += b.len() as u64;
        }
        w.flush().await?;
        off += n;
        if let Some(e) = rx.error() {
            // The exit status is reported by the caller.
            debug!("{} ended: {}", path, e);
            return Ok(off);
        }
        if n == 0 {
            return Ok(off);
        }
    }
}
