use crate::commands::{local_context, read_manifest, CompilerFlags};
use crate::{logging, output};

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use runner_service::compiler;
use runner_service::coordinator::models::Status;
use runner_service::ir::{RunPolicy, Spec};
use runner_service::{
    lint, policy, progress_channel, Execer, ExecutionEvent, KubeClient, KubernetesEngine,
    ProgressReporter, ProgressStreamer, Reporter, State,
};

/// Run a pipeline file against a cluster without a server
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Path to the pipeline configuration file
    #[arg(value_name = "FILE", default_value = ".drone.yml")]
    pub source: PathBuf,

    /// Name of the pipeline to run (default: the first one)
    #[arg(long, value_name = "NAME", default_value = "")]
    pub pipeline: String,

    /// Enable the clone step
    #[arg(long)]
    pub clone: bool,

    /// Run only the named steps (can be repeated)
    #[arg(long, value_name = "STEP")]
    pub include: Vec<String>,

    /// Skip the named steps (can be repeated)
    #[arg(long, value_name = "STEP")]
    pub exclude: Vec<String>,

    #[command(flatten)]
    pub flags: CompilerFlags,

    /// Kubeconfig file (default: in-cluster or ~/.kube/config)
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Policy file
    #[arg(long, value_name = "FILE")]
    pub policy: Option<PathBuf>,

    /// Namespace the pod runs in
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Maximum number of steps running at once (0: unbounded)
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub max_procs: usize,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Enable trace logging
    #[arg(long)]
    pub trace: bool,

    /// Print the compiled spec before running
    #[arg(long)]
    pub dump: bool,

    /// Pretty print the dumped spec
    #[arg(long)]
    pub pretty: bool,
}

pub async fn execute(args: ExecArgs) -> Result<()> {
    logging::init(args.debug, args.trace);

    output::status("Parsing", &format!("{}", args.source.display()));
    let manifest = read_manifest(&args.source, &args.flags.environ()?)?;
    let mut pipeline = manifest.lookup(&args.pipeline)?.clone();
    pipeline.clone.disable = !args.clone;
    if let Some(namespace) = args.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        pipeline.metadata.namespace = namespace.to_string();
    }

    let (build, repo, stage, system) = local_context(&pipeline);
    lint(&pipeline, repo.trusted)?;

    let mut compiler = args.flags.compiler()?;
    if let Some(path) = &args.policy {
        compiler = compiler.with_policies(policy::load(path)?);
    }
    let mut spec = compiler
        .compile(&compiler::CompileArgs {
            pipeline: &pipeline,
            manifest: &manifest,
            build: &build,
            repo: &repo,
            stage: &stage,
            system: &system,
            netrc: None,
            secrets: &[],
        })
        .await?;
    select_steps(&mut spec, &args.include, &args.exclude);

    if args.dump {
        let json = if args.pretty {
            serde_json::to_string_pretty(&spec)?
        } else {
            serde_json::to_string(&spec)?
        };
        println!("{}", json);
    }

    let client = match &args.kubeconfig {
        Some(path) => KubeClient::from_kubeconfig(path).await,
        None => KubeClient::try_default().await,
    }
    .wrap_err("cannot connect to the cluster")?;
    let engine = Arc::new(KubernetesEngine::new(Arc::new(client)));

    let (tx, mut rx) = progress_channel();
    let reporter = Arc::new(ProgressReporter::new(tx.clone()));
    let streamer = Arc::new(ProgressStreamer::new(tx));

    let state = Arc::new(State::new(build, repo, stage, system));
    {
        let mut s = state.lock().await;
        s.populate(&spec);
        s.start_stage();
        reporter.report_stage(&mut s).await?;
    }

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("Interrupted, cancelling pipeline");
                ctx.cancel();
            }
        });
    }

    // The execer owns the last senders; the event loop ends when it returns.
    let execer = Execer::new(engine, reporter, streamer).with_max_procs(args.max_procs);
    let exec_handle = {
        let state = state.clone();
        tokio::spawn(async move { execer.exec(&ctx, Arc::new(spec), state).await })
    };

    while let Some(event) = rx.recv().await {
        render(&event);
    }

    if let Err(errors) = exec_handle.await? {
        output::error(&errors.to_string());
    }

    let stage = state.stage().await;
    if matches!(stage.status, Status::Error | Status::Failing | Status::Killed) {
        std::process::exit(1);
    }
    Ok(())
}

/// Mark steps outside the include list, or inside the exclude list, as never run
fn select_steps(spec: &mut Spec, include: &[String], exclude: &[String]) {
    for step in &mut spec.steps {
        let included = include.is_empty() || include.contains(&step.name);
        if !included || exclude.contains(&step.name) {
            step.run_policy = RunPolicy::Never;
        }
    }
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::StageStarted {
            stage_name,
            total_steps,
        } => {
            println!();
            output::stage_header(stage_name, *total_steps);
        }

        ExecutionEvent::StageCompleted {
            stage_name,
            status,
            duration,
        } => {
            println!();
            if *status == Status::Passing {
                output::success(&format!(
                    "Stage '{}' completed successfully in {:.2}s",
                    stage_name,
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Stage '{}' {} after {:.2}s",
                    stage_name,
                    status.as_str(),
                    duration.as_secs_f64()
                ));
            }
        }

        ExecutionEvent::StepStarted {
            step_name,
            step_number,
            image,
        } => {
            output::step_header(*step_number, step_name, image);
        }

        ExecutionEvent::StepOutput {
            step_name,
            output: text,
        } => {
            for line in text.lines() {
                output::step_output(step_name, line);
            }
        }

        ExecutionEvent::StepCompleted {
            step_name,
            status,
            exit_code,
            duration,
        } => {
            let message = format!(
                "    {} {} ({:.2}s, exit code {})",
                step_name,
                status.as_str(),
                duration.as_secs_f64(),
                exit_code
            );
            if *status == Status::Passing {
                output::dim_success(&message);
            } else {
                output::dim_failure(&message);
            }
        }

        ExecutionEvent::StepSkipped { step_name, reason } => {
            output::dim(&format!("    {} skipped: {}", step_name, reason));
        }

        ExecutionEvent::Error { message, step_name } => match step_name {
            Some(step) => output::error(&format!("{}: {}", step, message)),
            None => output::error(message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_service::ir::Step;

    fn spec(names: &[&str]) -> Spec {
        Spec {
            steps: names
                .iter()
                .map(|name| Step {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn policies(spec: &Spec) -> Vec<RunPolicy> {
        spec.steps.iter().map(|s| s.run_policy).collect()
    }

    #[test]
    fn test_select_steps_include() {
        let mut spec = spec(&["clone", "build", "test"]);
        select_steps(&mut spec, &["build".to_string()], &[]);
        assert_eq!(
            policies(&spec),
            vec![RunPolicy::Never, RunPolicy::Default, RunPolicy::Never]
        );
    }

    #[test]
    fn test_select_steps_exclude() {
        let mut spec = spec(&["clone", "build", "test"]);
        select_steps(&mut spec, &[], &["test".to_string()]);
        assert_eq!(
            policies(&spec),
            vec![RunPolicy::Default, RunPolicy::Default, RunPolicy::Never]
        );
    }

    #[test]
    fn test_select_steps_none() {
        let mut spec = spec(&["build"]);
        select_steps(&mut spec, &[], &[]);
        assert_eq!(policies(&spec), vec![RunPolicy::Default]);
    }
}
