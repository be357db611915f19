// Credential Providers
// Secret and registry credential lookup chains used by the compiler

use crate::coordinator::models::{Build, Repo, Secret as RepoSecret};
use crate::image;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by credential providers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("secret provider error: {0}")]
    Secret(String),

    #[error("registry provider error: {0}")]
    Registry(String),

    #[error("invalid docker config: {0}")]
    DockerConfig(String),
}

/// Context for a credential lookup
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub build: &'a Build,
    pub repo: &'a Repo,
}

/// A resolved secret value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretValue {
    pub name: String,
    pub data: String,
}

/// Looks up secrets by name
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn find(
        &self,
        req: &ProviderRequest<'_>,
        name: &str,
    ) -> Result<Option<SecretValue>, ProviderError>;
}

/// Secrets shipped with the stage details; hidden from pull requests
/// unless explicitly allowed
pub struct StaticSecrets {
    secrets: Vec<RepoSecret>,
}

impl StaticSecrets {
    pub fn new(secrets: Vec<RepoSecret>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn find(
        &self,
        req: &ProviderRequest<'_>,
        name: &str,
    ) -> Result<Option<SecretValue>, ProviderError> {
        let is_pull_request = req.build.event == "pull_request";
        Ok(self
            .secrets
            .iter()
            .find(|s| s.name == name && (s.pull_request || !is_pull_request))
            .map(|s| SecretValue {
                name: s.name.clone(),
                data: s.data.clone(),
            }))
    }
}

/// Global secrets configured on the runner
#[derive(Debug, Clone, Default)]
pub struct MapSecrets {
    secrets: BTreeMap<String, String>,
}

impl MapSecrets {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretProvider for MapSecrets {
    async fn find(
        &self,
        _req: &ProviderRequest<'_>,
        name: &str,
    ) -> Result<Option<SecretValue>, ProviderError> {
        Ok(self.secrets.get(name).map(|data| SecretValue {
            name: name.to_string(),
            data: data.clone(),
        }))
    }
}

/// Tries each provider in order and returns the first hit
#[derive(Default, Clone)]
pub struct ChainedSecrets {
    providers: Vec<Arc<dyn SecretProvider>>,
}

impl ChainedSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

#[async_trait]
impl SecretProvider for ChainedSecrets {
    async fn find(
        &self,
        req: &ProviderRequest<'_>,
        name: &str,
    ) -> Result<Option<SecretValue>, ProviderError> {
        for provider in &self.providers {
            if let Some(secret) = provider.find(req, name).await? {
                return Ok(Some(secret));
            }
        }
        Ok(None)
    }
}

/// Credentials for one registry host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Pre-encoded `user:password` token, passed through untouched
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
}

/// Lists registry credentials available to a stage
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    async fn list(&self, req: &ProviderRequest<'_>) -> Result<Vec<RegistryCredential>, ProviderError>;
}

/// A fixed credential list
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    credentials: Vec<RegistryCredential>,
}

impl StaticRegistry {
    pub fn new(credentials: Vec<RegistryCredential>) -> Self {
        Self { credentials }
    }

    /// Load credentials from a docker `config.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProviderError::DockerConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(Self::new(parse_docker_config(&data)?))
    }
}

#[async_trait]
impl RegistryProvider for StaticRegistry {
    async fn list(&self, _req: &ProviderRequest<'_>) -> Result<Vec<RegistryCredential>, ProviderError> {
        Ok(self.credentials.clone())
    }
}

/// Concatenates the credentials of several providers
#[derive(Default, Clone)]
pub struct ChainedRegistry {
    providers: Vec<Arc<dyn RegistryProvider>>,
}

impl ChainedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn RegistryProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

#[async_trait]
impl RegistryProvider for ChainedRegistry {
    async fn list(&self, req: &ProviderRequest<'_>) -> Result<Vec<RegistryCredential>, ProviderError> {
        let mut out = Vec::new();
        for provider in &self.providers {
            out.extend(provider.list(req).await?);
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DockerAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    auth: String,
}

/// Parse the `auths` section of a docker config JSON document
pub fn parse_docker_config(data: &str) -> Result<Vec<RegistryCredential>, ProviderError> {
    let config: DockerConfig =
        serde_json::from_str(data).map_err(|e| ProviderError::DockerConfig(e.to_string()))?;
    Ok(config
        .auths
        .into_iter()
        .map(|(address, auth)| RegistryCredential {
            address: image::normalize_hostname(&address),
            username: auth.username,
            password: auth.password,
            auth: auth.auth,
        })
        .collect())
}

/// Encode credentials as a `kubernetes.io/dockerconfigjson` payload
pub fn encode_docker_config(credentials: &[RegistryCredential]) -> String {
    let config = DockerConfig {
        auths: credentials
            .iter()
            .map(|c| {
                (
                    c.address.clone(),
                    DockerAuth {
                        username: c.username.clone(),
                        password: c.password.clone(),
                        auth: c.auth.clone(),
                    },
                )
            })
            .collect(),
    };
    serde_json::to_string(&config).unwrap_or_default()
}

/// Credentials whose host serves at least one of the images; first match per host wins
pub fn matching_credentials<'a, I>(credentials: &[RegistryCredential], images: I) -> Vec<RegistryCredential>
where
    I: IntoIterator<Item = &'a str>,
{
    let hosts: Vec<String> = images.into_iter().map(image::hostname).collect();
    let mut out: Vec<RegistryCredential> = Vec::new();
    for credential in credentials {
        let host = image::normalize_hostname(&credential.address);
        if hosts.contains(&host) && !out.iter().any(|c| c.address == host) {
            out.push(RegistryCredential {
                address: host,
                ..credential.clone()
            });
        }
    }
    out
}
