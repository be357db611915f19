use crate::commands::{local_context, read_manifest, CompilerFlags};

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use runner_service::compiler;
use runner_service::{lint, SequentialIds};

/// Compile a pipeline file and print the resulting spec
#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Path to the pipeline configuration file
    #[arg(long, value_name = "FILE", default_value = ".drone.yml")]
    pub source: PathBuf,

    /// Name of the pipeline to compile (default: the first one)
    #[arg(long, value_name = "NAME", default_value = "")]
    pub pipeline: String,

    #[command(flatten)]
    pub flags: CompilerFlags,

    /// Use sequential container and volume ids
    #[arg(long)]
    pub stable_ids: bool,
}

pub async fn execute(args: CompileArgs) -> Result<()> {
    let manifest = read_manifest(&args.source, &args.flags.environ()?)?;
    let pipeline = manifest.lookup(&args.pipeline)?;
    let (build, repo, stage, system) = local_context(pipeline);
    lint(pipeline, repo.trusted)?;

    let mut compiler = args.flags.compiler()?;
    if args.stable_ids {
        compiler = compiler.with_ids(Arc::new(SequentialIds::new()));
    }

    let spec = compiler
        .compile(&compiler::CompileArgs {
            pipeline,
            manifest: &manifest,
            build: &build,
            repo: &repo,
            stage: &stage,
            system: &system,
            netrc: None,
            secrets: &[],
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}
