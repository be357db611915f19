// Pipeline Compiler
// Transforms a linted manifest pipeline plus build metadata into a Spec

pub mod credentials;
pub mod environ;
pub mod random;
pub mod script;

pub use credentials::{
    ChainedRegistry, ChainedSecrets, MapSecrets, ProviderError, ProviderRequest,
    RegistryCredential, RegistryProvider, SecretProvider, StaticRegistry, StaticSecrets,
};
pub use random::{IdGenerator, RandomIds, SequentialIds};

use crate::coordinator::models::{Build, Netrc, Repo, Secret as RepoSecret, Stage, System};
use crate::error::ServiceError;
use crate::image;
use crate::ir::{
    self, PullPolicy, ResourceValues, Resources, RunPolicy, Secret, SecretVar, Spec, Volume,
    VolumeMount, CLONE_STEP, RESERVED_VOLUMES,
};
use crate::manifest::{self, Manifest, Match, Parameter, Pipeline};
use crate::policy::{self, Policy};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Image used for the implicit clone step
pub const DEFAULT_CLONE_IMAGE: &str = "drone/git:latest";

/// Image every container runs until it is launched
pub const DEFAULT_PLACEHOLDER: &str = "drone/placeholder:1";

/// Name of the shared workspace volume
pub const WORKSPACE_VOLUME: &str = "_workspace";

const MAX_LABEL_LENGTH: usize = 63;

/// Errors raised while compiling
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("bad config: {0}")]
    BadConfig(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<CompileError> for ServiceError {
    fn from(err: CompileError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

/// Per-stage compiler input
#[derive(Debug, Clone, Copy)]
pub struct CompileArgs<'a> {
    pub pipeline: &'a Pipeline,
    pub manifest: &'a Manifest,
    pub build: &'a Build,
    pub repo: &'a Repo,
    pub stage: &'a Stage,
    pub system: &'a System,
    pub netrc: Option<&'a Netrc>,
    /// Repository secrets shipped with the stage details
    pub secrets: &'a [RepoSecret],
}

/// Compiler settings shared by every stage a runner executes
#[derive(Clone)]
pub struct Compiler {
    /// Global environment added to every step
    pub environ: BTreeMap<String, String>,
    /// Global labels added to every pod
    pub labels: BTreeMap<String, String>,
    /// Image patterns that run privileged when no commands are given
    pub privileged: Vec<String>,
    /// Host paths mounted into every step (host path to container path)
    pub volumes: BTreeMap<String, String>,
    /// Resource defaults for steps that set none
    pub resources: Resources,
    pub clone_image: String,
    pub placeholder: String,
    pub policies: Vec<Policy>,
    /// Only expose netrc credentials to the clone step
    pub netrc_clone_only: bool,
    pub secret: Arc<dyn SecretProvider>,
    pub registry: Arc<dyn RegistryProvider>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending secret reference collected while compiling steps
struct SecretRef {
    step: usize,
    env: String,
    secret: String,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            environ: BTreeMap::new(),
            labels: BTreeMap::new(),
            privileged: Vec::new(),
            volumes: BTreeMap::new(),
            resources: Resources::default(),
            clone_image: DEFAULT_CLONE_IMAGE.to_string(),
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            policies: Vec::new(),
            netrc_clone_only: false,
            secret: Arc::new(MapSecrets::default()),
            registry: Arc::new(StaticRegistry::default()),
            ids: Arc::new(RandomIds),
        }
    }

    pub fn with_environ(mut self, environ: BTreeMap<String, String>) -> Self {
        self.environ = environ;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_privileged(mut self, images: Vec<String>) -> Self {
        self.privileged = images;
        self
    }

    pub fn with_volumes(mut self, volumes: BTreeMap<String, String>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_clone_image(mut self, image: impl Into<String>) -> Self {
        let image = image.into();
        if !image.is_empty() {
            self.clone_image = image;
        }
        self
    }

    pub fn with_placeholder(mut self, image: impl Into<String>) -> Self {
        let image = image.into();
        if !image.is_empty() {
            self.placeholder = image;
        }
        self
    }

    pub fn with_policies(mut self, policies: Vec<Policy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_secret_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.secret = provider;
        self
    }

    pub fn with_registry_provider(mut self, provider: Arc<dyn RegistryProvider>) -> Self {
        self.registry = provider;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_netrc_clone_only(mut self, enabled: bool) -> Self {
        self.netrc_clone_only = enabled;
        self
    }

    /// Compile a pipeline into a spec
    pub async fn compile(&self, args: &CompileArgs<'_>) -> Result<Spec, CompileError> {
        let pipeline = args.pipeline;
        let mut spec = Spec::default();

        spec.platform = ir::Platform {
            os: non_empty(&pipeline.platform.os, "linux"),
            arch: non_empty(&pipeline.platform.arch, "amd64"),
            variant: pipeline.platform.variant.clone(),
            version: pipeline.platform.version.clone(),
        };
        let windows = spec.platform.is_windows();
        let os = spec.platform.os.clone();
        let (base, path, full) = workspace_paths(pipeline, windows);

        // Pod metadata
        spec.pod_spec.name = format!("drone-{}", self.ids.next_id());
        if pipeline.metadata.namespace.is_empty() {
            spec.pod_spec.namespace = format!("drone-{}", self.ids.next_id());
            spec.owns_namespace = true;
        } else {
            spec.pod_spec.namespace = pipeline.metadata.namespace.clone();
        }
        spec.pod_spec.labels = environ::combine([
            &self.labels,
            &pipeline.metadata.labels,
            &system_labels(&spec.pod_spec.name, args),
        ]);
        spec.pod_spec.annotations = pipeline.metadata.annotations.clone();
        spec.pod_spec.node_selector = pipeline.node_selector.clone();
        spec.pod_spec.tolerations = pipeline.tolerations.clone();
        spec.pod_spec.service_account_name = pipeline.service_account_name.clone();
        spec.pod_spec.dns_config = pipeline.dns_config.clone();
        spec.pod_spec.host_aliases = pipeline.host_aliases.clone();

        // Volumes
        spec.volumes.push(Volume::EmptyDir {
            id: self.ids.next_id(),
            name: WORKSPACE_VOLUME.to_string(),
            medium: None,
            size_limit: None,
        });
        for volume in &pipeline.volumes {
            if RESERVED_VOLUMES.contains(&volume.name.as_str()) {
                return Err(CompileError::BadConfig(format!(
                    "volume name '{}' is reserved",
                    volume.name
                )));
            }
            let id = self.ids.next_id();
            let compiled = match (&volume.temp, &volume.host) {
                (_, Some(host)) => Volume::HostPath {
                    id,
                    name: volume.name.clone(),
                    path: host.path.clone(),
                },
                (Some(temp), None) => Volume::EmptyDir {
                    id,
                    name: volume.name.clone(),
                    medium: (temp.medium.eq_ignore_ascii_case("memory"))
                        .then(|| "Memory".to_string()),
                    size_limit: (temp.size_limit.0 > 0).then_some(temp.size_limit.0),
                },
                (None, None) => Volume::EmptyDir {
                    id,
                    name: volume.name.clone(),
                    medium: None,
                    size_limit: None,
                },
            };
            spec.volumes.push(compiled);
        }
        let mut global_mounts = Vec::new();
        for (i, (host, target)) in self.volumes.iter().enumerate() {
            let name = format!("_host_volume_{}", i);
            spec.volumes.push(Volume::HostPath {
                id: self.ids.next_id(),
                name: name.clone(),
                path: host.clone(),
            });
            global_mounts.push(VolumeMount {
                name,
                path: target.clone(),
            });
        }

        // Base environment
        let mut pipeline_env = BTreeMap::new();
        let mut pipeline_secrets = Vec::new();
        for (key, value) in &pipeline.environment {
            match value.secret() {
                Some(secret) => pipeline_secrets.push((key.clone(), secret.to_string())),
                None => {
                    pipeline_env.insert(key.clone(), value.text().unwrap_or_default());
                }
            }
        }
        let base_env = environ::combine([
            &self.environ,
            &pipeline_env,
            &environ::proxy(),
            &environ::system(args.system),
            &environ::repo(args.repo),
            &environ::build(args.build),
            &environ::stage(args.stage),
            &environ::link(args.repo, args.build, args.system),
            &environ::workspace(&base, &path, &full),
        ]);
        let netrc_env = args.netrc.map(environ::netrc).unwrap_or_default();
        if let Some(netrc) = args.netrc {
            if !netrc.password.is_empty() {
                spec.secrets.insert(
                    "DRONE_NETRC_PASSWORD".to_string(),
                    Secret {
                        name: "DRONE_NETRC_PASSWORD".to_string(),
                        data: netrc.password.clone(),
                        mask: true,
                    },
                );
            }
        }

        let workspace_mount = VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            path: base.clone(),
        };
        let ctx = StepContext {
            os: &os,
            working_dir: &full,
            base_env: &base_env,
            netrc_env: if self.netrc_clone_only { None } else { Some(&netrc_env) },
            mounts: {
                let mut mounts = vec![workspace_mount.clone()];
                mounts.extend(global_mounts.iter().cloned());
                mounts
            },
            build_match: build_match(args),
        };

        let mut secret_refs = Vec::new();
        let pipeline_refs = |index: usize| {
            pipeline_secrets.iter().map(move |(env, secret)| SecretRef {
                step: index,
                env: env.clone(),
                secret: secret.clone(),
            })
        };

        // Clone step
        if !pipeline.clone.disable {
            secret_refs.extend(pipeline_refs(spec.steps.len()));
            spec.steps.push(self.clone_step(pipeline, &ctx, &netrc_env));
        }

        // Services and steps
        let sources = pipeline
            .services
            .iter()
            .map(|s| (s, true))
            .chain(pipeline.steps.iter().map(|s| (s, false)));
        for (src, detach) in sources {
            let index = spec.steps.len();
            let (step, refs) = self.compile_step(pipeline, src, detach, &ctx)?;
            spec.steps.push(step);
            secret_refs.extend(refs.into_iter().map(|(env, secret)| SecretRef {
                step: index,
                env,
                secret,
            }));
            secret_refs.extend(pipeline_refs(index));
        }

        resolve_dependencies(&mut spec);

        // Credentials
        let chain = ChainedSecrets::new()
            .with(Arc::new(StaticSecrets::new(args.secrets.to_vec())))
            .with(self.secret.clone());
        let req = ProviderRequest {
            build: args.build,
            repo: args.repo,
        };
        self.resolve_secrets(&mut spec, &chain, &req, args.manifest, secret_refs)
            .await?;
        self.resolve_registry(&mut spec, pipeline, &chain, &req).await?;

        // Resource defaults, then policy
        for step in &mut spec.steps {
            fill_resources(&mut step.resources.limits, self.resources.limits);
            fill_resources(&mut step.resources.requests, self.resources.requests);
        }
        if let Some(policy) = policy::select(&self.policies, &ctx.build_match) {
            tracing::debug!(policy = %policy.name, "applying policy");
            policy.apply(&mut spec);
        }

        Ok(spec)
    }

    fn clone_step(
        &self,
        pipeline: &Pipeline,
        ctx: &StepContext<'_>,
        netrc_env: &BTreeMap<String, String>,
    ) -> ir::Step {
        let mut envs = environ::combine([ctx.base_env, netrc_env]);
        let clone = &pipeline.clone;
        if clone.depth > 0 {
            envs.insert("PLUGIN_DEPTH".to_string(), clone.depth.to_string());
        }
        if clone.skip_verify {
            envs.insert("PLUGIN_SKIP_VERIFY".to_string(), "true".to_string());
            envs.insert("GIT_SSL_NO_VERIFY".to_string(), "true".to_string());
        }
        if clone.trace {
            envs.insert("PLUGIN_TRACE".to_string(), "true".to_string());
        }
        if clone.retries > 0 {
            envs.insert("PLUGIN_RETRIES".to_string(), clone.retries.to_string());
        }

        ir::Step {
            id: self.ids.next_id(),
            name: CLONE_STEP.to_string(),
            image: image::expand(&self.clone_image),
            placeholder: image::expand(&self.placeholder),
            pull: PullPolicy::IfNotExists,
            working_dir: ctx.working_dir.to_string(),
            envs,
            volumes: ctx.mounts.clone(),
            ..Default::default()
        }
    }

    #[allow(clippy::type_complexity)]
    fn compile_step(
        &self,
        pipeline: &Pipeline,
        src: &manifest::Step,
        detach: bool,
        ctx: &StepContext<'_>,
    ) -> Result<(ir::Step, Vec<(String, String)>), CompileError> {
        let mut secret_refs = Vec::new();

        let mut envs = ctx.base_env.clone();
        if let Some(netrc) = ctx.netrc_env {
            envs.extend(netrc.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for (key, value) in &src.environment {
            match value.secret() {
                Some(secret) => secret_refs.push((key.clone(), secret.to_string())),
                None => {
                    envs.insert(key.clone(), value.text().unwrap_or_default());
                }
            }
        }
        for (key, value) in &src.settings {
            let key = setting_key(key);
            match value {
                Parameter::Secret { from_secret } => secret_refs.push((key, from_secret.clone())),
                Parameter::Value(value) => {
                    envs.insert(key, encode_setting(value));
                }
            }
        }

        let mut volumes = ctx.mounts.clone();
        for mount in &src.volumes {
            if RESERVED_VOLUMES.contains(&mount.name.as_str()) {
                return Err(CompileError::BadConfig(format!(
                    "volume name '{}' is reserved",
                    mount.name
                )));
            }
            if pipeline.volume(&mount.name).is_none() {
                return Err(CompileError::BadConfig(format!(
                    "step '{}' mounts undeclared volume '{}'",
                    src.name, mount.name
                )));
            }
            volumes.push(VolumeMount {
                name: mount.name.clone(),
                path: mount.path.clone(),
            });
        }

        let no_override =
            src.commands.is_empty() && src.entrypoint.is_empty() && src.command.is_empty();
        let mut step = ir::Step {
            id: self.ids.next_id(),
            name: src.name.clone(),
            image: image::expand(&src.image),
            placeholder: image::expand(&self.placeholder),
            pull: PullPolicy::parse(&src.pull),
            entrypoint: src.entrypoint.clone(),
            command: src.command.clone(),
            working_dir: non_empty(&src.working_dir, ctx.working_dir),
            user: src.user.as_ref().and_then(|u| u.as_uid()),
            envs,
            secrets: Vec::new(),
            run_policy: run_policy(src, &ctx.build_match),
            ignore_err: src.ignores_failure(),
            detach,
            privileged: src.privileged || (no_override && image::matches(&src.image, &self.privileged)),
            depends_on: src.depends_on.clone(),
            resources: Resources {
                limits: ResourceValues {
                    cpu: src.resources.limits.cpu.0,
                    memory: src.resources.limits.memory.0,
                },
                requests: ResourceValues {
                    cpu: src.resources.requests.cpu.0,
                    memory: src.resources.requests.memory.0,
                },
            },
            shm_size: src.shm_size.0,
            volumes,
        };

        if !src.commands.is_empty() {
            let generated = script::generate(ctx.os, &src.commands);
            step.entrypoint = generated.entrypoint;
            step.command = generated.command;
            step.envs.insert(script::SCRIPT_VAR.to_string(), generated.script);
        }

        Ok((step, secret_refs))
    }

    async fn resolve_secrets(
        &self,
        spec: &mut Spec,
        chain: &ChainedSecrets,
        req: &ProviderRequest<'_>,
        manifest: &Manifest,
        refs: Vec<SecretRef>,
    ) -> Result<(), CompileError> {
        let mut cache: HashMap<String, Option<credentials::SecretValue>> = HashMap::new();

        for r in refs {
            if !cache.contains_key(&r.secret) {
                let found = chain.find(req, &r.secret).await?;
                cache.insert(r.secret.clone(), found);
            }
            match cache.get(&r.secret).and_then(|v| v.as_ref()) {
                Some(found) => {
                    spec.secrets
                        .entry(found.name.clone())
                        .or_insert_with(|| Secret {
                            name: found.name.clone(),
                            data: found.data.clone(),
                            mask: true,
                        });
                    spec.steps[r.step].secrets.push(SecretVar {
                        name: found.name.clone(),
                        env: r.env,
                    });
                }
                None if manifest.secret(&r.secret).is_some() => {
                    return Err(CompileError::BadConfig(format!(
                        "secret '{}' requires an external secret provider",
                        r.secret
                    )));
                }
                None => {
                    tracing::debug!(secret = %r.secret, "secret not found");
                }
            }
        }

        Ok(())
    }

    async fn resolve_registry(
        &self,
        spec: &mut Spec,
        pipeline: &Pipeline,
        chain: &ChainedSecrets,
        req: &ProviderRequest<'_>,
    ) -> Result<(), CompileError> {
        let mut available = self.registry.list(req).await?;
        for name in &pipeline.image_pull_secrets {
            match chain.find(req, name).await? {
                Some(found) => available.extend(credentials::parse_docker_config(&found.data)?),
                None => tracing::debug!(secret = %name, "image pull secret not found"),
            }
        }

        let matched = credentials::matching_credentials(
            &available,
            spec.steps.iter().map(|s| s.image.as_str()),
        );
        if !matched.is_empty() {
            spec.pull_secret = Some(Secret {
                name: format!("{}-pull", spec.pod_spec.name),
                data: credentials::encode_docker_config(&matched),
                mask: false,
            });
        }
        Ok(())
    }
}

/// Shared inputs for compiling each step
struct StepContext<'a> {
    os: &'a str,
    working_dir: &'a str,
    base_env: &'a BTreeMap<String, String>,
    netrc_env: Option<&'a BTreeMap<String, String>>,
    mounts: Vec<VolumeMount>,
    build_match: Match,
}

/// The build tuple evaluated by `when`, `trigger` and policy match blocks
pub fn build_match(args: &CompileArgs<'_>) -> Match {
    Match {
        action: args.build.action.clone(),
        branch: args.build.target.clone(),
        cron: args.build.cron.clone(),
        event: args.build.event.clone(),
        instance: args.system.host.clone(),
        reference: args.build.reference.clone(),
        repo: args.repo.slug.clone(),
        target: args.build.deploy_to.clone(),
    }
}

fn run_policy(step: &manifest::Step, m: &Match) -> RunPolicy {
    if !step.when.matches(m) {
        RunPolicy::Never
    } else if step.when.runs_always() {
        RunPolicy::Always
    } else if step.when.runs_on_failure() {
        RunPolicy::OnFailure
    } else {
        RunPolicy::Default
    }
}

/// Assign dependency edges: explicit DAG when any step declares
/// `depends_on`, otherwise a serial chain in source order.
fn resolve_dependencies(spec: &mut Spec) {
    let explicit = spec
        .steps
        .iter()
        .any(|s| s.name != CLONE_STEP && !s.depends_on.is_empty());
    let has_clone = spec.steps.iter().any(|s| s.name == CLONE_STEP);

    if explicit {
        for step in spec.steps.iter_mut().filter(|s| s.name != CLONE_STEP) {
            if !has_clone {
                step.depends_on.retain(|d| d != CLONE_STEP);
            } else if step.depends_on.is_empty() {
                step.depends_on.push(CLONE_STEP.to_string());
            }
        }
    } else {
        for i in 1..spec.steps.len() {
            let previous = spec.steps[i - 1].name.clone();
            spec.steps[i].depends_on = vec![previous];
        }
    }
}

fn system_labels(pod_name: &str, args: &CompileArgs<'_>) -> BTreeMap<String, String> {
    [
        ("io.drone", "true".to_string()),
        ("io.drone.name", pod_name.to_string()),
        ("io.drone.repo.namespace", args.repo.namespace.clone()),
        ("io.drone.repo.name", args.repo.name.clone()),
        ("io.drone.build.number", args.build.number.to_string()),
        ("io.drone.stage.name", args.stage.name.clone()),
        ("io.drone.stage.number", args.stage.number.to_string()),
        ("io.drone.created", args.stage.created.to_string()),
        ("io.drone.protected", args.repo.protected.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), sanitize_label(&v)))
    .collect()
}

/// Coerce a value into the kubernetes label value grammar
pub fn sanitize_label(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_LENGTH)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// `PLUGIN_<UPPER_SNAKE>` environment name for a setting key
fn setting_key(key: &str) -> String {
    let upper: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("PLUGIN_{}", upper)
}

/// Scalars as text, scalar lists comma-joined, anything else as JSON
fn encode_setting(value: &serde_yaml::Value) -> String {
    use serde_yaml::Value;
    match value {
        Value::Sequence(items) if items.iter().all(is_scalar) => items
            .iter()
            .map(manifest::models::scalar_text)
            .collect::<Vec<_>>()
            .join(","),
        other => manifest::models::scalar_text(other),
    }
}

fn is_scalar(value: &serde_yaml::Value) -> bool {
    use serde_yaml::Value;
    matches!(value, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn fill_resources(target: &mut ResourceValues, defaults: ResourceValues) {
    if target.cpu == 0 {
        target.cpu = defaults.cpu;
    }
    if target.memory == 0 {
        target.memory = defaults.memory;
    }
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Workspace base, relative path and full path
fn workspace_paths(pipeline: &Pipeline, windows: bool) -> (String, String, String) {
    let (base, sep) = if windows {
        ("c:\\drone\\src", '\\')
    } else {
        ("/drone/src", '/')
    };
    let path = pipeline.workspace.path.trim_matches(|c| c == '/' || c == '\\');
    let full = if path.is_empty() {
        base.to_string()
    } else {
        format!("{}{}{}", base, sep, path)
    };
    (base.to_string(), path.to_string(), full)
}
