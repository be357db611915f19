// CLI Commands
// Subcommands plus the compiler flags and local build context they share

pub mod compile;
pub mod controller;
pub mod copy;
pub mod daemon;
pub mod entrypoint;
pub mod exec;

use crate::config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;

use runner_service::compiler::{Compiler, MapSecrets, StaticRegistry};
use runner_service::coordinator::models::{Build, Repo, Stage, Status, System};
use runner_service::ir::{ResourceValues, Resources};
use runner_service::manifest::units::{parse_bytes, parse_cpu};
use runner_service::manifest::{envsubst, Manifest};
use runner_service::Pipeline;

/// Compiler settings accepted by `compile` and `exec`
#[derive(Args, Debug, Clone, Default)]
pub struct CompilerFlags {
    /// Secret available to steps (can be repeated, format: NAME=VALUE)
    #[arg(long = "secrets", value_name = "NAME=VALUE")]
    pub secrets: Vec<String>,

    /// Environment variable added to every step (format: NAME=VALUE)
    #[arg(long = "environ", value_name = "NAME=VALUE")]
    pub environ: Vec<String>,

    /// Label added to the pod (format: KEY=VALUE)
    #[arg(long = "labels", value_name = "KEY=VALUE")]
    pub labels: Vec<String>,

    /// Host path mounted into every step (format: HOST:CONTAINER)
    #[arg(long = "volumes", value_name = "HOST:CONTAINER")]
    pub volumes: Vec<String>,

    /// Image allowed to run privileged
    #[arg(long = "privileged", value_name = "IMAGE")]
    pub privileged: Vec<String>,

    /// Default CPU limit for steps, e.g. 500m
    #[arg(long, value_name = "CPU")]
    pub cpu_limit: Option<String>,

    /// Default CPU request for steps
    #[arg(long, value_name = "CPU")]
    pub cpu_request: Option<String>,

    /// Default memory limit for steps, e.g. 1Gi
    #[arg(long, value_name = "BYTES")]
    pub memory: Option<String>,

    /// Default memory request for steps
    #[arg(long, value_name = "BYTES")]
    pub memory_request: Option<String>,

    /// Docker config file holding registry credentials
    #[arg(long, value_name = "FILE")]
    pub docker_config: Option<PathBuf>,
}

impl CompilerFlags {
    pub fn environ(&self) -> Result<BTreeMap<String, String>> {
        config::parse_assignments(&self.environ)
    }

    /// Build a compiler from the flags
    pub fn compiler(&self) -> Result<Compiler> {
        let mut volumes = BTreeMap::new();
        for item in &self.volumes {
            let (host, container) = item
                .split_once(':')
                .ok_or_else(|| eyre!("invalid volume '{}'. Expected HOST:CONTAINER", item))?;
            volumes.insert(host.to_string(), container.to_string());
        }

        let resources = Resources {
            limits: ResourceValues {
                cpu: parse_optional(self.cpu_limit.as_deref(), parse_cpu)?,
                memory: parse_optional(self.memory.as_deref(), parse_bytes)?,
            },
            requests: ResourceValues {
                cpu: parse_optional(self.cpu_request.as_deref(), parse_cpu)?,
                memory: parse_optional(self.memory_request.as_deref(), parse_bytes)?,
            },
        };

        let mut compiler = Compiler::new()
            .with_environ(self.environ()?)
            .with_labels(config::parse_assignments(&self.labels)?)
            .with_privileged(self.privileged.clone())
            .with_volumes(volumes)
            .with_resources(resources)
            .with_secret_provider(Arc::new(MapSecrets::new(config::parse_assignments(
                &self.secrets,
            )?)));

        if let Some(path) = &self.docker_config {
            let registry = StaticRegistry::from_file(path)
                .wrap_err_with(|| format!("cannot load docker config {}", path.display()))?;
            compiler = compiler.with_registry_provider(Arc::new(registry));
        }
        Ok(compiler)
    }
}

/// Parse an optional quantity, zero when unset
pub fn parse_optional<E: std::fmt::Display>(
    value: Option<&str>,
    parse: impl Fn(&str) -> std::result::Result<i64, E>,
) -> Result<i64> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => parse(value).map_err(|e| eyre!("invalid quantity '{}': {}", value, e)),
        None => Ok(0),
    }
}

/// Read a pipeline file, substituting `${NAME}` from `vars`
pub fn read_manifest(path: &Path, vars: &BTreeMap<String, String>) -> Result<Manifest> {
    if !path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", path.display());
    }
    let data = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read {}", path.display()))?;
    let data = envsubst(&data, |name| vars.get(name).cloned());
    Ok(Manifest::parse(&data)?)
}

/// Synthetic build metadata for running a pipeline outside a server
pub fn local_context(pipeline: &Pipeline) -> (Build, Repo, Stage, System) {
    let now = unix_now();
    let build = Build {
        id: 1,
        repo_id: 1,
        number: 1,
        status: Status::Running,
        event: "push".to_string(),
        reference: "refs/heads/main".to_string(),
        source: "main".to_string(),
        target: "main".to_string(),
        author_login: "local".to_string(),
        sender: "local".to_string(),
        started: now,
        created: now,
        updated: now,
        ..Default::default()
    };
    let repo = Repo {
        id: 1,
        namespace: "local".to_string(),
        name: "pipeline".to_string(),
        slug: "local/pipeline".to_string(),
        scm: "git".to_string(),
        default_branch: "main".to_string(),
        visibility: "private".to_string(),
        private: true,
        active: true,
        trusted: true,
        ..Default::default()
    };
    let stage = Stage {
        id: 1,
        repo_id: 1,
        build_id: 1,
        number: 1,
        name: pipeline.name.clone(),
        kind: pipeline.kind.clone(),
        stage_type: pipeline.pipeline_type.clone(),
        status: Status::Pending,
        os: pipeline.platform.os.clone(),
        arch: pipeline.platform.arch.clone(),
        created: now,
        ..Default::default()
    };
    let system = System {
        proto: "http".to_string(),
        host: "localhost".to_string(),
        link: "http://localhost".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    (build, repo, stage, system)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiler_flags() {
        let flags = CompilerFlags {
            environ: vec!["GOFLAGS=-mod=vendor".to_string()],
            labels: vec!["team=platform".to_string()],
            volumes: vec!["/var/cache:/cache".to_string()],
            cpu_limit: Some("500m".to_string()),
            memory: Some("1Gi".to_string()),
            ..Default::default()
        };
        let compiler = flags.compiler().unwrap();
        assert_eq!(compiler.environ["GOFLAGS"], "-mod=vendor");
        assert_eq!(compiler.labels["team"], "platform");
        assert_eq!(compiler.volumes["/var/cache"], "/cache");
        assert_eq!(compiler.resources.limits.cpu, 500);
        assert_eq!(compiler.resources.limits.memory, 1 << 30);
        assert_eq!(compiler.resources.requests.cpu, 0);
    }

    #[test]
    fn test_compiler_flags_invalid() {
        let flags = CompilerFlags {
            volumes: vec!["/var/cache".to_string()],
            ..Default::default()
        };
        assert!(flags.compiler().is_err());

        let flags = CompilerFlags {
            cpu_limit: Some("lots".to_string()),
            ..Default::default()
        };
        assert!(flags.compiler().is_err());
    }

    #[test]
    fn test_read_manifest_substitutes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".drone.yml");
        std::fs::write(
            &path,
            "kind: pipeline\ntype: kubernetes\nname: default\nsteps:\n- name: build\n  image: golang:${GO_VERSION}\n",
        )
        .unwrap();
        let vars = BTreeMap::from([("GO_VERSION".to_string(), "1.22".to_string())]);

        let manifest = read_manifest(&path, &vars).unwrap();
        let pipeline = manifest.lookup("").unwrap();
        assert_eq!(pipeline.steps[0].image, "golang:1.22");

        assert!(read_manifest(&dir.path().join("missing.yml"), &vars).is_err());
    }
}
