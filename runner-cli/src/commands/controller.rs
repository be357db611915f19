use crate::logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use runner_service::coordinator::models::Context;
use runner_service::ir::Spec;
use runner_service::{Compiler, HttpClient, KubeClient, KubernetesEngine, Runner};

/// Run a precompiled spec for a stage accepted elsewhere
#[derive(Args, Debug)]
pub struct ControllerArgs {
    /// Compiled spec (JSON)
    #[arg(long, value_name = "FILE")]
    pub spec: PathBuf,

    /// Stage details: build, repo, stage and system (JSON)
    #[arg(long, value_name = "FILE")]
    pub state: PathBuf,

    /// Coordinator connection settings (JSON)
    #[arg(long, value_name = "FILE")]
    pub client: PathBuf,

    /// Kubeconfig file (default: in-cluster)
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, env = "DRONE_DEBUG")]
    pub debug: bool,

    /// Enable trace logging
    #[arg(long, env = "DRONE_TRACE")]
    pub trace: bool,
}

/// Connection settings read from the `--client` file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub secret: String,
    pub skip_verify: bool,
    pub dump: bool,
    pub dump_body: bool,
}

fn decode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&data).wrap_err_with(|| format!("cannot decode {}", path.display()))
}

pub async fn execute(args: ControllerArgs) -> Result<()> {
    logging::init(args.debug, args.trace);

    let spec: Spec = decode(&args.spec)?;
    let detail: Context = decode(&args.state)?;
    let config: ClientConfig = decode(&args.client)?;

    let client = HttpClient::new(&config.endpoint, &config.secret, config.skip_verify)?
        .with_dump(config.dump, config.dump_body);
    let kube = match &args.kubeconfig {
        Some(path) => KubeClient::from_kubeconfig(path).await,
        None => KubeClient::try_default().await,
    }
    .wrap_err("cannot connect to the cluster")?;
    let engine = Arc::new(KubernetesEngine::new(Arc::new(kube)));
    let runner = Runner::new(Arc::new(client), Compiler::new(), engine);

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctx.cancel();
            }
        });
    }

    tracing::info!(
        stage.id = detail.stage.id,
        build.id = detail.build.id,
        "running compiled stage"
    );
    runner.run_spec(&ctx, detail, spec).await?;
    Ok(())
}
