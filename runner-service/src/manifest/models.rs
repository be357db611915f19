// Manifest Data Models
// Types representing the kubernetes pipeline YAML schema

use crate::ir::{DnsConfig, HostAlias, Toleration};
use crate::manifest::condition::Conditions;
use crate::manifest::units::{BytesSize, MilliCpu};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Pipeline
// =============================================================================

/// A `kind: pipeline` document with `type: kubernetes`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pipeline {
    pub kind: String,
    #[serde(rename = "type")]
    pub pipeline_type: String,
    pub name: String,
    pub platform: Platform,
    pub clone: CloneSettings,
    pub metadata: Metadata,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub service_account_name: String,
    pub dns_config: Option<DnsConfig>,
    pub host_aliases: Vec<HostAlias>,
    pub environment: BTreeMap<String, Variable>,
    pub image_pull_secrets: Vec<String>,
    pub services: Vec<Step>,
    pub steps: Vec<Step>,
    pub trigger: Conditions,
    pub volumes: Vec<Volume>,
    pub workspace: Workspace,
    pub depends_on: Vec<String>,
}

impl Pipeline {
    /// Services followed by steps, in source order
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.services.iter().chain(self.steps.iter())
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub variant: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneSettings {
    pub disable: bool,
    pub depth: i64,
    pub skip_verify: bool,
    pub trace: bool,
    pub retries: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workspace {
    pub path: String,
}

// =============================================================================
// Steps
// =============================================================================

/// A step or service container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    pub name: String,
    pub image: String,
    pub pull: String,
    pub commands: Vec<String>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub detach: bool,
    pub depends_on: Vec<String>,
    pub environment: BTreeMap<String, Variable>,
    pub settings: BTreeMap<String, Parameter>,
    pub failure: String,
    pub privileged: bool,
    pub resources: Resources,
    pub shm_size: BytesSize,
    pub user: Option<StringOrInt>,
    pub volumes: Vec<VolumeMount>,
    pub when: Conditions,
    pub working_dir: String,
}

impl Step {
    /// `failure: ignore`
    pub fn ignores_failure(&self) -> bool {
        self.failure.eq_ignore_ascii_case("ignore")
    }
}

/// An environment value: a literal or a secret reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    Secret { from_secret: String },
    Value(serde_yaml::Value),
}

impl Variable {
    pub fn from_value(value: impl Into<String>) -> Self {
        Self::Value(serde_yaml::Value::String(value.into()))
    }

    /// Secret name when the variable references one
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Secret { from_secret } => Some(from_secret),
            Self::Value(_) => None,
        }
    }

    /// Literal value rendered as text
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Secret { .. } => None,
            Self::Value(value) => Some(scalar_text(value)),
        }
    }
}

/// A plugin setting: any YAML value or a secret reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    Secret { from_secret: String },
    Value(serde_yaml::Value),
}

impl Parameter {
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Secret { from_secret } => Some(from_secret),
            Self::Value(_) => None,
        }
    }
}

/// Render a YAML scalar as plain text; non-scalars become JSON
pub fn scalar_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// A user given by name or numeric id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrInt {
    Int(i64),
    Text(String),
}

impl StringOrInt {
    /// Numeric uid, when the value is one
    pub fn as_uid(&self) -> Option<i64> {
        match self {
            Self::Int(uid) => Some(*uid),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub limits: ResourceObject,
    pub requests: ResourceObject,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceObject {
    pub cpu: MilliCpu,
    pub memory: BytesSize,
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

/// A pipeline volume, either a temporary directory or a host path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub name: String,
    pub temp: Option<VolumeTemp>,
    pub host: Option<VolumeHost>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeTemp {
    pub medium: String,
    pub size_limit: BytesSize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeHost {
    pub path: String,
}

// =============================================================================
// Secrets
// =============================================================================

/// A `kind: secret` document referencing an external secret store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretDoc {
    pub kind: String,
    pub name: String,
    pub get: SecretGet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretGet {
    pub path: String,
    pub name: String,
}
