// Intermediate Representation
// Compiled pipeline: pod spec, platform, ordered steps, volumes and secrets

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known name of the clone step
pub const CLONE_STEP: &str = "clone";

/// Names that user volumes may not take
pub const RESERVED_VOLUMES: &[&str] = &["workspace", "_workspace", "_docker_socket"];

/// A compiled pipeline, immutable once produced by the compiler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Spec {
    pub pod_spec: PodSpec,
    pub platform: Platform,
    pub steps: Vec<Step>,
    pub volumes: Vec<Volume>,
    /// Secret table keyed by secret name
    pub secrets: BTreeMap<String, Secret>,
    /// Docker config JSON for image pulls, if any credential matched
    pub pull_secret: Option<Secret>,
    pub network: Network,
    /// Whether setup created the namespace and destroy must delete it
    pub owns_namespace: bool,
}

impl Spec {
    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Look up a step by container id
    pub fn step_by_id(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Name of the secrets object that backs step secret references
    pub fn secret_object_name(&self) -> String {
        self.pod_spec.name.clone()
    }

    /// Secrets whose values must be masked in step output
    pub fn masked_secrets(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.values().filter(|s| s.mask)
    }
}

/// Pod-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub service_account_name: String,
    pub dns_config: Option<DnsConfig>,
    pub host_aliases: Vec<HostAlias>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toleration {
    pub key: String,
    pub operator: String,
    pub value: String,
    pub effect: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub nameservers: Vec<String>,
    pub searches: Vec<String>,
    pub options: Vec<DnsConfigOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfigOption {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

/// Target platform of the stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub variant: String,
    pub version: String,
}

impl Platform {
    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }
}

/// One container of the stage pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Container name, unique within the spec
    pub id: String,
    pub name: String,
    /// Image loaded when the step is launched
    pub image: String,
    /// Image the container runs until launch
    pub placeholder: String,
    pub pull: PullPolicy,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<i64>,
    pub envs: BTreeMap<String, String>,
    pub secrets: Vec<SecretVar>,
    pub run_policy: RunPolicy,
    pub ignore_err: bool,
    pub detach: bool,
    pub privileged: bool,
    pub depends_on: Vec<String>,
    pub resources: Resources,
    /// Size of `/dev/shm` in bytes, zero for the runtime default
    pub shm_size: i64,
    pub volumes: Vec<VolumeMount>,
}

/// A secret injected into a step as an environment variable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretVar {
    /// Key in the spec secret table
    pub name: String,
    /// Environment variable name
    pub env: String,
}

/// Entry of the spec secret table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub data: String,
    pub mask: bool,
}

/// Run policy of a step given the upstream outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPolicy {
    #[default]
    Default,
    Always,
    OnSuccess,
    OnFailure,
    Never,
}

/// Image pull policy of a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    #[default]
    Default,
    Always,
    IfNotExists,
    Never,
}

impl PullPolicy {
    /// Parse the manifest spelling (`always`, `if-not-exists`, `never`)
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "always" => Self::Always,
            "if-not-exists" | "if_not_exists" => Self::IfNotExists,
            "never" => Self::Never,
            _ => Self::Default,
        }
    }

    /// Kubernetes `imagePullPolicy` value, `None` for the cluster default
    pub fn as_kubernetes(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Always => Some("Always"),
            Self::IfNotExists => Some("IfNotPresent"),
            Self::Never => Some("Never"),
        }
    }
}

/// Step resource requests and limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub limits: ResourceValues,
    pub requests: ResourceValues,
}

/// CPU in millicores and memory in bytes; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceValues {
    pub cpu: i64,
    pub memory: i64,
}

impl ResourceValues {
    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0
    }
}

/// A volume mounted into a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

/// A pod volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Volume {
    /// Shared scratch directory, optionally memory-backed
    EmptyDir {
        /// Orchestrator-safe volume name
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        medium: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_limit: Option<i64>,
    },
    /// Bind of a node directory
    HostPath { id: String, name: String, path: String },
}

impl Volume {
    pub fn name(&self) -> &str {
        match self {
            Self::EmptyDir { name, .. } | Self::HostPath { name, .. } => name,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::EmptyDir { id, .. } | Self::HostPath { id, .. } => id,
        }
    }
}

/// Opaque network identifier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lookup() {
        let spec = Spec {
            steps: vec![
                Step {
                    id: "a1".to_string(),
                    name: "build".to_string(),
                    ..Default::default()
                },
                Step {
                    id: "b2".to_string(),
                    name: "test".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(spec.step("test").map(|s| s.id.as_str()), Some("b2"));
        assert_eq!(spec.step_by_id("a1").map(|s| s.name.as_str()), Some("build"));
        assert!(spec.step("deploy").is_none());
    }

    #[test]
    fn test_volume_serialization() {
        let volume = Volume::EmptyDir {
            id: "x1".to_string(),
            name: "_workspace".to_string(),
            medium: None,
            size_limit: None,
        };
        let json = serde_json::to_string(&volume).unwrap();
        assert_eq!(json, r#"{"type":"empty_dir","id":"x1","name":"_workspace"}"#);

        let parsed: Volume = serde_json::from_str(r#"{"type":"host_path","id":"x2","name":"cache","path":"/tmp"}"#).unwrap();
        assert_eq!(parsed.name(), "cache");
    }

    #[test]
    fn test_policies_parse() {
        assert_eq!(PullPolicy::parse("if-not-exists"), PullPolicy::IfNotExists);
        assert_eq!(PullPolicy::parse("Always").as_kubernetes(), Some("Always"));
        assert_eq!(PullPolicy::parse("").as_kubernetes(), None);

        let policy: RunPolicy = serde_json::from_str(r#""on-failure""#).unwrap();
        assert_eq!(policy, RunPolicy::OnFailure);
    }
}
