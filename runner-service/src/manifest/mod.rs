// Manifest Module
// Multi-document YAML configuration: pipelines and secret references

pub mod condition;
pub mod envsubst;
pub mod lint;
pub mod models;
pub mod units;

pub use condition::{Condition, Conditions, Match};
pub use envsubst::envsubst;
pub use lint::{lint, LintError};
pub use models::{Parameter, Pipeline, SecretDoc, Step, Variable};

use serde::Deserialize;
use thiserror::Error;

/// The only pipeline type this runner executes
pub const PIPELINE_TYPE: &str = "kubernetes";

/// Errors raised while parsing a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse document {index}: {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("manifest contains no kubernetes pipelines")]
    NoPipelines,
}

/// One typed document of a manifest
#[derive(Debug, Clone)]
pub enum Resource {
    Pipeline(Box<Pipeline>),
    Secret(SecretDoc),
}

/// A parsed configuration file
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub resources: Vec<Resource>,
}

impl Manifest {
    /// Parse every document, keeping kubernetes pipelines and secret
    /// references. Other kinds and pipeline types are ignored.
    pub fn parse(input: &str) -> Result<Self, ManifestError> {
        let mut resources = Vec::new();

        for (index, document) in serde_yaml::Deserializer::from_str(input).enumerate() {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|source| ManifestError::Parse { index, source })?;
            if value.is_null() {
                continue;
            }

            let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
            match kind {
                "pipeline" => {
                    let pipeline: Pipeline = serde_yaml::from_value(value)
                        .map_err(|source| ManifestError::Parse { index, source })?;
                    if pipeline.pipeline_type == PIPELINE_TYPE {
                        resources.push(Resource::Pipeline(Box::new(pipeline)));
                    }
                }
                "secret" => {
                    let secret: SecretDoc = serde_yaml::from_value(value)
                        .map_err(|source| ManifestError::Parse { index, source })?;
                    resources.push(Resource::Secret(secret));
                }
                _ => {}
            }
        }

        Ok(Self { resources })
    }

    /// All kubernetes pipelines in source order
    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Pipeline(p) => Some(p.as_ref()),
            Resource::Secret(_) => None,
        })
    }

    /// Secret reference documents
    pub fn secrets(&self) -> impl Iterator<Item = &SecretDoc> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Secret(s) => Some(s),
            Resource::Pipeline(_) => None,
        })
    }

    /// Find a pipeline by name; an empty name selects the first pipeline
    pub fn lookup(&self, name: &str) -> Result<&Pipeline, ManifestError> {
        if name.is_empty() {
            return self.pipelines().next().ok_or(ManifestError::NoPipelines);
        }
        self.pipelines()
            .find(|p| p.name == name)
            .ok_or_else(|| ManifestError::PipelineNotFound(name.to_string()))
    }

    /// Find an external secret reference by name
    pub fn secret(&self, name: &str) -> Option<&SecretDoc> {
        self.secrets().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
kind: pipeline
type: kubernetes
name: default

steps:
  - name: build
    image: golang
    commands:
      - go build

---
kind: pipeline
type: docker
name: ignored

steps:
  - name: build
    image: golang

---
kind: secret
name: token
get:
  path: secret/data/ci
  name: token

---
kind: signature
hmac: abc123
"#;

    #[test]
    fn test_parse_routes_documents() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(manifest.pipelines().count(), 1);
        assert_eq!(manifest.secret("token").map(|s| s.get.path.as_str()), Some("secret/data/ci"));
    }

    #[test]
    fn test_lookup() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.lookup("default").unwrap().steps.len(), 1);
        assert_eq!(manifest.lookup("").unwrap().name, "default");
        assert!(matches!(
            manifest.lookup("ignored"),
            Err(ManifestError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn test_parse_error_reports_document() {
        let err = Manifest::parse("kind: pipeline\ntype: kubernetes\nsteps: 12\n").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { index: 0, .. }));
    }
}
