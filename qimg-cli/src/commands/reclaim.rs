use std::path::PathBuf;

use clap::Args;
use qimg::{CancelFlag, ReclaimOptions};

use super::format_bytes;

#[derive(Args, Debug)]
pub struct ReclaimArgs {
    /// Path to the disk image
    pub path: PathBuf,

    /// Compress retained data clusters (existing data only; new guest
    /// writes are stored uncompressed)
    #[arg(short, long)]
    pub compress: bool,
}

pub async fn execute(args: ReclaimArgs) -> anyhow::Result<()> {
    let before = qimg::inspect_size(&args.path)?;

    // Ctrl-C cancels cooperatively; the original image is untouched as
    // long as the commit rename has not happened.
    let cancel = CancelFlag::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling, original image is untouched...");
                cancel.cancel();
            }
        })
    };

    let path = args.path.clone();
    let options = ReclaimOptions {
        compress: args.compress,
        cancel: Some(cancel),
    };
    let result = tokio::task::spawn_blocking(move || qimg::reclaim(&path, &options)).await?;
    watcher.abort();
    result?;

    let after = qimg::inspect_size(&args.path)?;
    println!(
        "{}: {} -> {} ({} reclaimed)",
        args.path.display(),
        format_bytes(before),
        format_bytes(after),
        format_bytes(before.saturating_sub(after))
    );
    Ok(())
}
