use std::path::PathBuf;

use clap::Args;

use super::format_bytes;

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Path to the disk image
    pub path: PathBuf,

    /// Emit machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: InfoArgs) -> anyhow::Result<()> {
    let path = args.path.clone();
    let info = tokio::task::spawn_blocking(move || qimg::inspect(&path)).await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("image:          {}", info.path.display());
    println!(
        "virtual size:   {} ({} bytes)",
        format_bytes(info.virtual_size),
        info.virtual_size
    );
    println!(
        "allocated size: {} ({} bytes)",
        format_bytes(info.allocated_size),
        info.allocated_size
    );
    println!("cluster size:   {}", format_bytes(info.cluster_size));
    if let Some(backing) = &info.backing_file {
        println!("backing file:   {}", backing);
    }
    Ok(())
}
