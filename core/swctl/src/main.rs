//! swctl: command-line client for the Coachly edge worker daemon.
//!
//! ## Subcommands
//!
//! - `health`: daemon and worker status
//! - `fetch`: send a request through the worker
//! - `sync`: replay one queued mutation, or all of them
//! - `skip-waiting`: activate a waiting worker version
//! - `listen`: print sync notifications as they are broadcast
//! - `queue` / `caches`: inspect worker state
//! - `redirect`: compute the canonical host for a URL (local, no daemon)

mod commands;
mod daemon_client;
mod error;
mod logging;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "swctl")]
#[command(about = "Coachly edge worker control")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon health and worker state
    Health,

    /// Send a request through the worker
    Fetch {
        #[arg(value_name = "URL")]
        url: String,

        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header as name:value (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Request mode (navigate, same-origin, no-cors, cors)
        #[arg(long)]
        mode: Option<String>,

        /// Request destination (document, script, style, image, font)
        #[arg(long)]
        destination: Option<String>,

        /// Credentials mode; `omit` strips cookie and authorization headers
        #[arg(long)]
        credentials: Option<String>,

        /// Print response headers
        #[arg(short, long)]
        include: bool,
    },

    /// Replay a queued mutation (all of them when no tag is given)
    Sync {
        #[arg(value_name = "TAG")]
        tag: Option<String>,
    },

    /// Activate a worker that is waiting for the previous version to let go
    SkipWaiting,

    /// Stream sync notifications until interrupted
    Listen,

    /// List queued mutations
    Queue,

    /// List caches and their bounds
    Caches,

    /// Compute the redirect target for a location
    Redirect {
        #[arg(value_name = "URL")]
        url: String,

        /// Viewer role (instructor, student, admin)
        #[arg(long)]
        role: Option<String>,

        /// Subdomain assigned to the viewer
        #[arg(long)]
        subdomain: Option<String>,

        /// Apex domain; defaults to the configured one
        #[arg(long)]
        apex: Option<String>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Health => commands::health(),
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            mode,
            destination,
            credentials,
            include,
        } => commands::fetch(commands::FetchArgs {
            url,
            method,
            headers,
            data,
            mode,
            destination,
            credentials,
            include_headers: include,
        }),
        Commands::Sync { tag } => commands::sync(tag),
        Commands::SkipWaiting => commands::skip_waiting(),
        Commands::Listen => commands::listen(),
        Commands::Queue => commands::queue(),
        Commands::Caches => commands::caches(),
        Commands::Redirect {
            url,
            role,
            subdomain,
            apex,
        } => commands::redirect(&url, role.as_deref(), subdomain, apex),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "swctl command failed");
        eprintln!("swctl: {}", err);
        std::process::exit(1);
    }
}
