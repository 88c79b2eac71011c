//! qimg - QCOW2 disk image maintenance CLI.

mod commands;

use clap::{Parser, Subcommand};

use commands::{create, info, reclaim, resize};

#[derive(Parser)]
#[command(name = "qimg", version, about = "QCOW2 disk image maintenance")]
struct Cli {
    /// Log filter directive (e.g. "info" or "qimg=debug")
    #[arg(long, env = "QIMG_LOG", default_value = "warn", global = true)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show virtual and allocated size of an image
    Info(info::InfoArgs),
    /// Reclaim unused space by re-converting an image
    Reclaim(reclaim::ReclaimArgs),
    /// Grow the logical capacity of an image
    Resize(resize::ResizeArgs),
    /// Create a new image or COW overlay
    Create(create::CreateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Info(args) => info::execute(args).await,
        Commands::Reclaim(args) => reclaim::execute(args).await,
        Commands::Resize(args) => resize::execute(args).await,
        Commands::Create(args) => create::execute(args).await,
    }
}
