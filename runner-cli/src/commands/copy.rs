use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

/// Copy the runner binary into a shared volume
#[derive(Args, Debug)]
pub struct CopyArgs {
    /// File to copy (default: this executable)
    #[arg(long, value_name = "FILE")]
    pub source: Option<PathBuf>,

    /// Destination path
    #[arg(long, value_name = "FILE")]
    pub target: PathBuf,
}

/// Copy `source` to `target` and mark it executable
pub fn copy_executable(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target).wrap_err_with(|| {
        format!("cannot copy {} to {}", source.display(), target.display())
    })?;
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
        .wrap_err_with(|| format!("cannot chmod {}", target.display()))?;
    Ok(())
}

pub fn execute(args: CopyArgs) -> Result<()> {
    let source = match args.source {
        Some(source) => source,
        None => std::env::current_exe()?,
    };
    copy_executable(&source, &args.target)
}
