//! `uvd` — operator CLI for the dispatch backend.
//!
//! Database verbs talk to `UVD_DATABASE_URL`; producer verbs additionally
//! honor `UVD_GEOCODE_URL` for live geocoding (synthetic points otherwise).

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "uvd", about = "UV dispatch backend operator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database lifecycle: migrate, status.
    Db {
        #[command(subcommand)]
        cmd: commands::DbCmd,
    },
    /// Grab-log partition maintenance.
    Partition {
        #[command(subcommand)]
        cmd: commands::PartitionCmd,
    },
    /// Synthetic load generation.
    Produce {
        #[command(subcommand)]
        cmd: commands::ProduceCmd,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Db { cmd } => commands::run_db(cmd).await,
        Commands::Partition { cmd } => commands::run_partition(cmd).await,
        Commands::Produce { cmd } => commands::run_produce(cmd).await,
    }
}
