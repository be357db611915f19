// Entrypoint
// In-container wrapper: waits for the launch signal file, runs the step
// process in its own group and records the exit code

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

/// Wrap a step process inside its container
#[derive(Args, Debug)]
pub struct EntrypointArgs {
    /// Program to run
    #[arg(long, value_name = "PROGRAM")]
    pub name: String,

    /// Argument passed to the program (can be repeated)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// File whose appearance starts the program
    #[arg(long, value_name = "FILE")]
    pub waitfile: Option<PathBuf>,

    /// File the exit code is written to
    #[arg(long, value_name = "FILE")]
    pub donefile: Option<PathBuf>,

    /// Poll interval for the wait file in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 100)]
    pub interval: u64,
}

/// Outcome of waiting for the launch signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Start the program
    Ready,
    /// The step was cancelled before launch
    Skip,
}

/// Path of the file that cancels a pending launch
pub fn error_file(waitfile: &Path) -> PathBuf {
    let mut name = OsString::from(waitfile.as_os_str());
    name.push(".err");
    PathBuf::from(name)
}

/// Poll until `waitfile` or its `.err` sibling exists
pub async fn wait_for(waitfile: &Path, interval: Duration) -> Wait {
    let errfile = error_file(waitfile);
    loop {
        if errfile.exists() {
            return Wait::Skip;
        }
        if waitfile.exists() {
            return Wait::Ready;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Exit code of a finished process, 128 plus the signal number when killed
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Spawn the program in a new process group and forward SIGINT and SIGTERM
/// to the whole group until it exits
pub async fn run(name: &str, args: &[String]) -> Result<i32> {
    let mut child = Command::new(name)
        .args(args)
        .process_group(0)
        .spawn()
        .wrap_err_with(|| format!("cannot start {}", name))?;
    let pgid = child
        .id()
        .map(|pid| Pid::from_raw(pid as i32))
        .ok_or_else(|| eyre!("{} exited before it could be tracked", name))?;

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        let forward = tokio::select! {
            status = child.wait() => return Ok(exit_code(status?)),
            _ = interrupt.recv() => Signal::SIGINT,
            _ = terminate.recv() => Signal::SIGTERM,
        };
        tracing::debug!(signal = %forward, "forwarding signal");
        if let Err(err) = killpg(pgid, forward) {
            tracing::warn!(error = %err, "cannot forward signal");
        }
    }
}

pub async fn execute(args: EntrypointArgs) -> Result<()> {
    if let Some(waitfile) = &args.waitfile {
        let interval = Duration::from_millis(args.interval.max(1));
        if wait_for(waitfile, interval).await == Wait::Skip {
            std::process::exit(0);
        }
    }

    let code = run(&args.name, &args.args).await?;

    if let Some(donefile) = &args.donefile {
        std::fs::write(donefile, code.to_string())
            .wrap_err_with(|| format!("cannot write {}", donefile.display()))?;
    }
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_file() {
        assert_eq!(
            error_file(Path::new("/run/drone/step1")),
            PathBuf::from("/run/drone/step1.err")
        );
    }

    #[tokio::test]
    async fn test_wait_for_ready() {
        let dir = tempfile::tempdir().unwrap();
        let waitfile = dir.path().join("step");
        let task = {
            let waitfile = waitfile.clone();
            tokio::spawn(async move { wait_for(&waitfile, Duration::from_millis(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&waitfile, "").unwrap();
        assert_eq!(task.await.unwrap(), Wait::Ready);
    }

    #[tokio::test]
    async fn test_wait_for_skip() {
        let dir = tempfile::tempdir().unwrap();
        let waitfile = dir.path().join("step");
        std::fs::write(error_file(&waitfile), "").unwrap();
        assert_eq!(wait_for(&waitfile, Duration::from_millis(5)).await, Wait::Skip);
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let code = run("sh", &["-c".to_string(), "exit 3".to_string()]).await.unwrap();
        assert_eq!(code, 3);
        let code = run("true", &[]).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        assert!(run("/nonexistent/program", &[]).await.is_err());
    }
}
