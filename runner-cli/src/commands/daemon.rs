// Daemon
// Long-running runner: polls the coordination server and serves a health endpoint

use crate::commands::parse_optional;
use crate::{config, logging};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::{Args, Parser};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use runner_service::compiler::{MapSecrets, StaticRegistry};
use runner_service::coordinator::models::Filter;
use runner_service::manifest::units::{parse_bytes, parse_cpu, BytesSize, MilliCpu};
use runner_service::manifest::PIPELINE_TYPE;
use runner_service::policy::{
    self, Policy, PolicyMetadata, PolicyResourceValues, PolicyResources, DEFAULT_POLICY,
};
use runner_service::{
    Client, Compiler, HttpClient, KubeClient, KubernetesEngine, Limits, Poller, Runner,
};

/// Env file read when no path is given
const DEFAULT_ENV_FILE: &str = ".env";

/// Delay between server pings during startup
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Poll the coordination server and run stages
#[derive(Args, Debug, Clone, Default)]
pub struct DaemonArgs {
    /// File of KEY=VALUE settings loaded before the environment is read
    #[arg(value_name = "ENVFILE")]
    pub envfile: Option<PathBuf>,
}

/// Runner settings, read from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "kube-runner")]
pub struct Settings {
    #[arg(long, env = "DRONE_DEBUG")]
    pub debug: bool,

    #[arg(long, env = "DRONE_TRACE")]
    pub trace: bool,

    #[arg(long, env = "DRONE_RPC_PROTO", default_value = "http")]
    pub rpc_proto: String,

    #[arg(long, env = "DRONE_RPC_HOST")]
    pub rpc_host: String,

    #[arg(long, env = "DRONE_RPC_SECRET", hide_env_values = true)]
    pub rpc_secret: String,

    #[arg(long, env = "DRONE_RPC_SKIP_VERIFY")]
    pub rpc_skip_verify: bool,

    #[arg(long, env = "DRONE_RPC_DUMP_HTTP")]
    pub rpc_dump_http: bool,

    #[arg(long, env = "DRONE_RPC_DUMP_HTTP_BODY")]
    pub rpc_dump_http_body: bool,

    #[arg(long, env = "DRONE_RUNNER_NAME", default_value = "")]
    pub runner_name: String,

    #[arg(long, env = "DRONE_RUNNER_CAPACITY", default_value_t = 2)]
    pub runner_capacity: usize,

    #[arg(long, env = "DRONE_RUNNER_MAX_PROCS", default_value_t = 0)]
    pub runner_max_procs: usize,

    /// Variables added to every step (key:value,...)
    #[arg(long, env = "DRONE_RUNNER_ENVIRON", default_value = "")]
    pub runner_environ: String,

    /// File of variables added to every step
    #[arg(long, env = "DRONE_RUNNER_ENV_FILE")]
    pub runner_env_file: Option<PathBuf>,

    /// Global secrets (key:value,...)
    #[arg(long, env = "DRONE_RUNNER_SECRETS", default_value = "", hide_env_values = true)]
    pub runner_secrets: String,

    /// Labels a stage must match (key:value,...)
    #[arg(long, env = "DRONE_RUNNER_LABELS", default_value = "")]
    pub runner_labels: String,

    /// Host paths mounted into every step (host:container,...)
    #[arg(long, env = "DRONE_RUNNER_VOLUMES", default_value = "")]
    pub runner_volumes: String,

    #[arg(long, env = "DRONE_RUNNER_PRIVILEGED_IMAGES", default_value = "")]
    pub runner_privileged_images: String,

    #[arg(long, env = "DRONE_PLATFORM_OS", default_value = "linux")]
    pub platform_os: String,

    #[arg(long, env = "DRONE_PLATFORM_ARCH", default_value = "amd64")]
    pub platform_arch: String,

    #[arg(long, env = "DRONE_PLATFORM_KERNEL", default_value = "")]
    pub platform_kernel: String,

    #[arg(long, env = "DRONE_PLATFORM_VARIANT", default_value = "")]
    pub platform_variant: String,

    /// Repository globs this runner accepts (comma separated)
    #[arg(long, env = "DRONE_LIMIT_REPOS", default_value = "")]
    pub limit_repos: String,

    /// Build events this runner accepts (comma separated)
    #[arg(long, env = "DRONE_LIMIT_EVENTS", default_value = "")]
    pub limit_events: String,

    #[arg(long, env = "DRONE_LIMIT_TRUSTED")]
    pub limit_trusted: bool,

    /// Health endpoint address, `:PORT` binds every interface
    #[arg(long, env = "DRONE_SERVER_PORT", default_value = ":3000")]
    pub server_port: String,

    #[arg(long, env = "DRONE_IMAGE_CLONE")]
    pub image_clone: Option<String>,

    #[arg(long, env = "DRONE_IMAGE_PLACEHOLDER")]
    pub image_placeholder: Option<String>,

    #[arg(long, env = "DRONE_NETRC_CLONE_ONLY")]
    pub netrc_clone_only: bool,

    /// Docker config file holding registry credentials
    #[arg(long, env = "DRONE_DOCKER_CONFIG")]
    pub docker_config: Option<PathBuf>,

    #[arg(long, env = "DRONE_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    #[arg(long, env = "DRONE_NAMESPACE_DEFAULT", default_value = "default")]
    pub namespace_default: String,

    #[arg(long, env = "DRONE_NODE_SELECTOR_DEFAULT", default_value = "")]
    pub node_selector_default: String,

    #[arg(long, env = "DRONE_LABELS_DEFAULT", default_value = "")]
    pub labels_default: String,

    #[arg(long, env = "DRONE_ANNOTATIONS_DEFAULT", default_value = "")]
    pub annotations_default: String,

    #[arg(long, env = "DRONE_SERVICE_ACCOUNT_DEFAULT", default_value = "")]
    pub service_account_default: String,

    #[arg(long, env = "DRONE_RESOURCE_LIMIT_CPU", default_value = "")]
    pub resource_limit_cpu: String,

    #[arg(long, env = "DRONE_RESOURCE_LIMIT_MEMORY", default_value = "")]
    pub resource_limit_memory: String,

    #[arg(long, env = "DRONE_RESOURCE_REQUEST_CPU", default_value = "")]
    pub resource_request_cpu: String,

    #[arg(long, env = "DRONE_RESOURCE_REQUEST_MEMORY", default_value = "")]
    pub resource_request_memory: String,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::try_parse_from(["kube-runner"]).map_err(|e| eyre!("invalid configuration: {}", e))
    }

    pub fn endpoint(&self) -> String {
        format!("{}://{}", self.rpc_proto, self.rpc_host)
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        let addr = match self.server_port.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.server_port.clone(),
        };
        addr.parse()
            .wrap_err_with(|| format!("invalid server address '{}'", self.server_port))
    }

    pub fn machine(&self) -> String {
        if !self.runner_name.is_empty() {
            return self.runner_name.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_default()
    }

    pub fn filter(&self) -> Result<Filter> {
        Ok(Filter {
            kind: "pipeline".to_string(),
            filter_type: PIPELINE_TYPE.to_string(),
            os: self.platform_os.clone(),
            arch: self.platform_arch.clone(),
            variant: self.platform_variant.clone(),
            kernel: self.platform_kernel.clone(),
            labels: config::parse_map(&self.runner_labels)?,
        })
    }

    pub fn limits(&self) -> Limits {
        Limits {
            repos: config::parse_list(&self.limit_repos),
            events: config::parse_list(&self.limit_events),
            trusted: self.limit_trusted,
        }
    }

    /// Step variables from the settings and the optional env file
    pub fn environ(&self) -> Result<BTreeMap<String, String>> {
        let mut environ = config::parse_map(&self.runner_environ)?;
        if let Some(path) = &self.runner_env_file {
            let data = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("cannot read env file {}", path.display()))?;
            environ.extend(config::parse_env_file(&data));
        }
        Ok(environ)
    }

    /// Policy synthesised from the `*_DEFAULT` and `RESOURCE_*` settings
    pub fn default_policy(&self) -> Result<Policy> {
        Ok(Policy {
            name: DEFAULT_POLICY.to_string(),
            metadata: PolicyMetadata {
                namespace: self.namespace_default.clone(),
                labels: config::parse_map(&self.labels_default)?,
                annotations: config::parse_map(&self.annotations_default)?,
            },
            resources: PolicyResources {
                limit: PolicyResourceValues {
                    cpu: MilliCpu(parse_optional(Some(&self.resource_limit_cpu), parse_cpu)?),
                    memory: BytesSize(parse_optional(Some(&self.resource_limit_memory), parse_bytes)?),
                },
                request: PolicyResourceValues {
                    cpu: MilliCpu(parse_optional(Some(&self.resource_request_cpu), parse_cpu)?),
                    memory: BytesSize(parse_optional(Some(&self.resource_request_memory), parse_bytes)?),
                },
            },
            node_selector: config::parse_map(&self.node_selector_default)?,
            service_account_name: self.service_account_default.clone(),
            ..Default::default()
        })
    }

    /// Policies from the policy file, with the synthesised default appended
    /// when the file does not define one
    pub fn policies(&self) -> Result<Vec<Policy>> {
        let mut policies = match &self.policy_file {
            Some(path) => policy::load(path)?,
            None => Vec::new(),
        };
        if !policies.iter().any(Policy::is_default) {
            policies.push(self.default_policy()?);
        }
        Ok(policies)
    }

    pub fn compiler(&self) -> Result<Compiler> {
        let mut compiler = Compiler::new()
            .with_environ(self.environ()?)
            .with_privileged(config::parse_list(&self.runner_privileged_images))
            .with_volumes(config::parse_map(&self.runner_volumes)?)
            .with_policies(self.policies()?)
            .with_netrc_clone_only(self.netrc_clone_only)
            .with_secret_provider(Arc::new(MapSecrets::new(config::parse_map(
                &self.runner_secrets,
            )?)));
        if let Some(image) = &self.image_clone {
            compiler = compiler.with_clone_image(image);
        }
        if let Some(image) = &self.image_placeholder {
            compiler = compiler.with_placeholder(image);
        }
        if let Some(path) = &self.docker_config {
            let registry = StaticRegistry::from_file(path)
                .wrap_err_with(|| format!("cannot load docker config {}", path.display()))?;
            compiler = compiler.with_registry_provider(Arc::new(registry));
        }
        Ok(compiler)
    }
}

fn load_env(args: &DaemonArgs) -> Result<()> {
    match &args.envfile {
        Some(path) => config::load_env_file(path),
        None if Path::new(DEFAULT_ENV_FILE).exists() => {
            config::load_env_file(Path::new(DEFAULT_ENV_FILE))
        }
        None => Ok(()),
    }
}

/// Cancel `ctx` on SIGINT or SIGTERM
fn watch_signals(ctx: CancellationToken) -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("received shutdown signal");
        ctx.cancel();
    });
    Ok(())
}

async fn healthz() -> &'static str {
    "OK"
}

/// Block until the server answers, or `ctx` is cancelled
async fn wait_for_server(ctx: &CancellationToken, client: &dyn Client) {
    loop {
        match client.ping().await {
            Ok(()) => {
                tracing::info!("successfully pinged the remote server");
                return;
            }
            Err(err) => tracing::error!(error = %err, "cannot ping the remote server"),
        }
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(PING_INTERVAL) => {}
        }
    }
}

pub async fn execute(args: DaemonArgs) -> Result<()> {
    load_env(&args)?;
    let settings = Settings::from_env()?;
    logging::init(settings.debug, settings.trace);

    let ctx = CancellationToken::new();
    watch_signals(ctx.clone())?;

    let client = Arc::new(
        HttpClient::new(settings.endpoint(), &settings.rpc_secret, settings.rpc_skip_verify)?
            .with_dump(settings.rpc_dump_http, settings.rpc_dump_http_body),
    );
    let kube = KubeClient::try_default()
        .await
        .wrap_err("cannot connect to the cluster")?;
    let engine = Arc::new(KubernetesEngine::new(Arc::new(kube)));

    let runner = Runner::new(client.clone(), settings.compiler()?, engine)
        .with_machine(settings.machine())
        .with_environ(settings.environ()?)
        .with_limits(settings.limits())
        .with_max_procs(settings.runner_max_procs);
    let poller = Poller::new(Arc::new(runner), settings.filter()?);

    let addr = settings.addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/healthz", get(healthz));
    let server = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(ctx.cancelled_owned())
                .await
        })
    };
    tracing::info!(addr = %addr, "health endpoint listening");

    wait_for_server(&ctx, client.as_ref()).await;

    tracing::info!(
        endpoint = %settings.endpoint(),
        capacity = settings.runner_capacity,
        kind = "pipeline",
        pipeline_type = PIPELINE_TYPE,
        "polling the remote server"
    );
    poller.poll(&ctx, settings.runner_capacity).await;

    ctx.cancel();
    server.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(extra: &[&str]) -> Settings {
        let mut args = vec![
            "kube-runner",
            "--rpc-host",
            "ci.example.com",
            "--rpc-secret",
            "s3cr3t",
        ];
        args.extend_from_slice(extra);
        Settings::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]);
        assert_eq!(s.endpoint(), "http://ci.example.com");
        assert_eq!(s.runner_capacity, 2);
        assert_eq!(s.addr().unwrap(), "0.0.0.0:3000".parse::<SocketAddr>().unwrap());
        assert_eq!(s.namespace_default, "default");
    }

    #[test]
    fn test_filter() {
        let s = settings(&["--runner-labels", "zone:eu,gpu:true", "--platform-arch", "arm64"]);
        let filter = s.filter().unwrap();
        assert_eq!(filter.kind, "pipeline");
        assert_eq!(filter.filter_type, "kubernetes");
        assert_eq!(filter.arch, "arm64");
        assert_eq!(filter.labels["gpu"], "true");
    }

    #[test]
    fn test_limits() {
        let s = settings(&["--limit-repos", "acme/*,octo/app", "--limit-trusted"]);
        let limits = s.limits();
        assert_eq!(limits.repos, vec!["acme/*", "octo/app"]);
        assert!(limits.events.is_empty());
        assert!(limits.trusted);
    }

    #[test]
    fn test_default_policy() {
        let s = settings(&[
            "--namespace-default",
            "ci",
            "--labels-default",
            "team:platform",
            "--resource-limit-cpu",
            "500m",
            "--resource-limit-memory",
            "1Gi",
            "--service-account-default",
            "builder",
        ]);
        let policies = s.policies().unwrap();
        assert_eq!(policies.len(), 1);
        let policy = &policies[0];
        assert!(policy.is_default());
        assert_eq!(policy.metadata.namespace, "ci");
        assert_eq!(policy.metadata.labels["team"], "platform");
        assert_eq!(policy.resources.limit.cpu, MilliCpu(500));
        assert_eq!(policy.resources.limit.memory, BytesSize(1 << 30));
        assert_eq!(policy.resources.request.cpu, MilliCpu(0));
        assert_eq!(policy.service_account_name, "builder");
    }

    #[test]
    fn test_policy_file_keeps_its_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yml");
        std::fs::write(&path, "- name: default\n  metadata:\n    namespace: from-file\n").unwrap();
        let s = settings(&["--policy-file", path.to_str().unwrap()]);

        let policies = s.policies().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].metadata.namespace, "from-file");
    }

    #[test]
    fn test_environ_merges_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.env");
        std::fs::write(&path, "GOPROXY=direct\n").unwrap();
        let s = settings(&[
            "--runner-environ",
            "GOFLAGS:-mod=vendor",
            "--runner-env-file",
            path.to_str().unwrap(),
        ]);

        let environ = s.environ().unwrap();
        assert_eq!(environ["GOFLAGS"], "-mod=vendor");
        assert_eq!(environ["GOPROXY"], "direct");
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(healthz().await, "OK");
    }
}
