use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct ResizeArgs {
    /// Path to the disk image
    pub path: PathBuf,

    /// New logical capacity in MiB (must exceed the current size)
    pub size_mib: u64,
}

pub async fn execute(args: ResizeArgs) -> anyhow::Result<()> {
    eprintln!(
        "warning: resizing is experimental and could result in data loss; \
         back up the image before proceeding"
    );

    let path = args.path.clone();
    let size_mib = args.size_mib;
    tokio::task::spawn_blocking(move || qimg::resize(&path, size_mib)).await??;

    println!("{}: resized to {} MiB", args.path.display(), args.size_mib);
    Ok(())
}
