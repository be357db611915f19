// Policy Engine
// Administrator defaults applied over a compiled spec

use crate::ir::{Spec, Toleration};
use crate::manifest::condition::{Conditions, Match};
use crate::manifest::units::{BytesSize, MilliCpu};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Name of the fallback policy
pub const DEFAULT_POLICY: &str = "default";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One administrator policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub name: String,
    #[serde(rename = "match")]
    pub matches: Conditions,
    pub metadata: PolicyMetadata,
    pub resources: PolicyResources,
    pub node_selector: BTreeMap<String, String>,
    pub merge_node_selector: bool,
    pub service_account_name: String,
    pub tolerations: Vec<Toleration>,
    pub append_tolerations: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyMetadata {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyResources {
    pub limit: PolicyResourceValues,
    pub request: PolicyResourceValues,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyResourceValues {
    pub cpu: MilliCpu,
    pub memory: BytesSize,
}

impl Policy {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_POLICY
    }

    /// Apply the policy over a spec.
    ///
    /// Namespace, service account, node selector and tolerations overwrite
    /// when the policy sets them; labels and annotations merge with the spec
    /// winning on collision; resources fill zero-valued step fields.
    pub fn apply(&self, spec: &mut Spec) {
        let pod = &mut spec.pod_spec;

        if !self.metadata.namespace.is_empty() {
            pod.namespace = self.metadata.namespace.clone();
            spec.owns_namespace = false;
        }
        if !self.service_account_name.is_empty() {
            pod.service_account_name = self.service_account_name.clone();
        }

        if self.merge_node_selector {
            pod.node_selector
                .extend(self.node_selector.iter().map(|(k, v)| (k.clone(), v.clone())));
        } else if !self.node_selector.is_empty() {
            pod.node_selector = self.node_selector.clone();
        }

        if self.append_tolerations {
            pod.tolerations.extend(self.tolerations.iter().cloned());
        } else if !self.tolerations.is_empty() {
            pod.tolerations = self.tolerations.clone();
        }

        for (k, v) in &self.metadata.labels {
            pod.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &self.metadata.annotations {
            pod.annotations.entry(k.clone()).or_insert_with(|| v.clone());
        }

        for step in &mut spec.steps {
            let resources = &mut step.resources;
            fill(&mut resources.limits.cpu, self.resources.limit.cpu.0);
            fill(&mut resources.limits.memory, self.resources.limit.memory.0);
            fill(&mut resources.requests.cpu, self.resources.request.cpu.0);
            fill(&mut resources.requests.memory, self.resources.request.memory.0);
        }
    }
}

fn fill(field: &mut i64, value: i64) {
    if *field == 0 {
        *field = value;
    }
}

/// Parse a YAML list of policies
pub fn parse(data: &str) -> Result<Vec<Policy>, PolicyError> {
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(data)?)
}

/// Read and parse a policy file
pub fn load(path: impl AsRef<Path>) -> Result<Vec<Policy>, PolicyError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&data)
}

/// Select the first non-default policy whose match block accepts the
/// build, falling back to the `default` policy
pub fn select<'a>(policies: &'a [Policy], m: &Match) -> Option<&'a Policy> {
    policies
        .iter()
        .filter(|p| !p.is_default())
        .find(|p| p.matches.matches(m))
        .or_else(|| policies.iter().find(|p| p.is_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ResourceValues, Resources, Step};

    const POLICIES: &str = r#"
- name: default
  metadata:
    namespace: ci
    labels:
      team: platform
  resources:
    limit:
      cpu: 1000
      memory: 1Gi
    request:
      cpu: 100m
      memory: 128Mi

- name: monorepo
  match:
    repo: [acme/monorepo]
  metadata:
    namespace: monorepo
  node_selector:
    pool: large
  tolerations:
    - key: dedicated
      operator: Equal
      value: ci
      effect: NoSchedule
  append_tolerations: true
"#;

    fn spec() -> Spec {
        let mut spec = Spec {
            owns_namespace: true,
            steps: vec![Step {
                name: "build".to_string(),
                resources: Resources {
                    limits: ResourceValues {
                        cpu: 2000,
                        memory: 0,
                    },
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        };
        spec.pod_spec.namespace = "drone-abc".to_string();
        spec.pod_spec.labels.insert("team".to_string(), "mobile".to_string());
        spec.pod_spec.tolerations.push(Toleration {
            key: "existing".to_string(),
            ..Default::default()
        });
        spec
    }

    #[test]
    fn test_select() {
        let policies = parse(POLICIES).unwrap();
        let m = Match {
            repo: "acme/monorepo".to_string(),
            ..Default::default()
        };
        assert_eq!(select(&policies, &m).map(|p| p.name.as_str()), Some("monorepo"));

        let m = Match {
            repo: "acme/other".to_string(),
            ..Default::default()
        };
        assert_eq!(select(&policies, &m).map(|p| p.name.as_str()), Some("default"));

        assert!(select(&[], &m).is_none());
    }

    #[test]
    fn test_apply_default() {
        let policies = parse(POLICIES).unwrap();
        let mut spec = spec();
        policies[0].apply(&mut spec);

        assert_eq!(spec.pod_spec.namespace, "ci");
        assert!(!spec.owns_namespace);
        // spec labels win on collision
        assert_eq!(spec.pod_spec.labels["team"], "mobile");

        let resources = spec.steps[0].resources;
        assert_eq!(resources.limits.cpu, 2000);
        assert_eq!(resources.limits.memory, 1 << 30);
        assert_eq!(resources.requests.cpu, 100);
        assert_eq!(resources.requests.memory, 128 << 20);
    }

    #[test]
    fn test_apply_appends_tolerations() {
        let policies = parse(POLICIES).unwrap();
        let mut spec = spec();
        policies[1].apply(&mut spec);

        assert_eq!(spec.pod_spec.tolerations.len(), 2);
        assert_eq!(spec.pod_spec.node_selector["pool"], "large");
    }

    #[test]
    fn test_apply_replaces_tolerations() {
        let mut policy = parse(POLICIES).unwrap().remove(1);
        policy.append_tolerations = false;
        let mut spec = spec();
        policy.apply(&mut spec);

        assert_eq!(spec.pod_spec.tolerations.len(), 1);
        assert_eq!(spec.pod_spec.tolerations[0].key, "dedicated");
    }
}
