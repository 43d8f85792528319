use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hushdrop::common::{apply_overrides, load_config, ConfigOverrides};
use hushdrop::server::{self, AppState};
use hushdrop::session::SessionMode;

#[derive(Parser)]
#[command(name = "hushdrop", version, about = "Ephemeral file sharing and chat over unguessable URLs")]
struct Cli {
    /// Listen port (0 picks one)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Keep the session usable after its first completed transfer
    #[arg(long, global = true)]
    persistent: bool,

    /// Do not shut down after a transfer completes
    #[arg(long, global = true)]
    stay_open: bool,

    /// Bind on all interfaces and disable the unknown-path shutdown guard
    #[arg(long, global = true)]
    public: bool,

    /// Expire the session after this many seconds
    #[arg(long, global = true)]
    ttl_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the given files for download
    Share {
        /// Files to share, streamed in the order given
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Accept uploads into a directory
    Receive {
        /// Destination directory (defaults to the configured downloads dir)
        dir: Option<PathBuf>,
    },
    /// Host an ephemeral chat room
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        port: cli.port,
        persistent: cli.persistent.then_some(true),
        stay_open: cli.stay_open.then_some(true),
        public_mode: cli.public.then_some(true),
    };
    let mut config = apply_overrides(load_config()?, &overrides);

    let mode = match &cli.command {
        Command::Share { files } => {
            for file in files {
                if !file.is_file() {
                    bail!("not a file: {}", file.display());
                }
            }
            SessionMode::Download {
                sources: files.clone(),
            }
        }
        Command::Receive { dir } => {
            if let Some(dir) = dir {
                config.downloads_dir = dir.clone();
            }
            std::fs::create_dir_all(&config.downloads_dir).with_context(|| {
                format!("cannot create {}", config.downloads_dir.display())
            })?;
            SessionMode::Upload
        }
        Command::Chat => SessionMode::Chat,
    };

    let persistent = config.persistent;
    let ttl = cli.ttl_secs.map(Duration::from_secs);

    let state = AppState::new(config);
    let session = state.registry.create(mode, persistent, ttl)?;
    let slug = session.slug().to_string();

    server::serve(state, move |bound| {
        println!("Serving at http://{bound}/{slug}");
        println!("Press Ctrl-C to stop");
    })
    .await
}
