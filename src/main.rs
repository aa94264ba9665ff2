mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(
    name = "habsim",
    about = "High-altitude balloon trajectory prediction server"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the prediction server
    Run,
    /// Warm the disk cache with the active cycle's artifacts
    Prefetch {
        /// Comma-separated member list (default: all)
        #[arg(long)]
        members: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => commands::handle_run().await,
        Commands::Prefetch { members } => commands::handle_prefetch(members).await,
    }
}
