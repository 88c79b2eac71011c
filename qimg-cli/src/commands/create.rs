use std::path::PathBuf;

use clap::{Args, ValueEnum};
use qimg::qcow2::{self, BackingFormat};

const BYTES_PER_MIB: u64 = 1024 * 1024;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Path of the image to create (must not exist)
    pub path: PathBuf,

    /// Logical capacity in MiB
    pub size_mib: u64,

    /// Create a COW overlay backed by this image
    #[arg(long)]
    pub backing: Option<PathBuf>,

    /// Format of the backing image
    #[arg(long, value_enum, default_value_t = BackingFormatArg::Qcow2, requires = "backing")]
    pub backing_format: BackingFormatArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum BackingFormatArg {
    Raw,
    Qcow2,
}

impl From<BackingFormatArg> for BackingFormat {
    fn from(arg: BackingFormatArg) -> Self {
        match arg {
            BackingFormatArg::Raw => BackingFormat::Raw,
            BackingFormatArg::Qcow2 => BackingFormat::Qcow2,
        }
    }
}

pub async fn execute(args: CreateArgs) -> anyhow::Result<()> {
    let size = args
        .size_mib
        .checked_mul(BYTES_PER_MIB)
        .ok_or_else(|| anyhow::anyhow!("size overflows"))?;

    let path = args.path.clone();
    let backing = args.backing.clone();
    let format: BackingFormat = args.backing_format.into();
    tokio::task::spawn_blocking(move || match backing {
        Some(base) => qcow2::create_overlay(&path, &base, format, size),
        None => qcow2::create_image(&path, size),
    })
    .await??;

    println!("{}: created ({} MiB)", args.path.display(), args.size_mib);
    Ok(())
}
