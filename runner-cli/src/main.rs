mod commands;
mod config;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// Kubernetes pipeline runner
#[derive(Parser, Debug)]
#[command(name = "kube-runner", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    daemon: commands::daemon::DaemonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the coordination server and run stages (default)
    Daemon(commands::daemon::DaemonArgs),

    /// Compile a pipeline file and print the resulting spec
    Compile(commands::compile::CompileArgs),

    /// Run a pipeline file against a cluster without a server
    Exec(commands::exec::ExecArgs),

    /// Run a precompiled spec for a stage accepted elsewhere
    #[command(hide = true)]
    Controller(commands::controller::ControllerArgs),

    /// Wrap a step process inside its container
    #[command(hide = true)]
    Entrypoint(commands::entrypoint::EntrypointArgs),

    /// Copy the runner binary into a shared volume
    #[command(hide = true)]
    Copy(commands::copy::CopyArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Daemon(cli.daemon));

    match command {
        Command::Daemon(args) => commands::daemon::execute(args).await,
        Command::Compile(args) => commands::compile::execute(args).await,
        Command::Exec(args) => commands::exec::execute(args).await,
        Command::Controller(args) => commands::controller::execute(args).await,
        Command::Entrypoint(args) => commands::entrypoint::execute(args).await,
        Command::Copy(args) => commands::copy::execute(args),
    }
}
