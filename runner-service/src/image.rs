// Image References
// Canonicalises registry/image/tag triples and answers match queries

use std::fmt;

const DEFAULT_DOMAIN: &str = "docker.io";
const OFFICIAL_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";

/// Registry hosts that all mean Docker Hub
const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry host (always set, `docker.io` by default)
    pub domain: String,
    /// Repository path within the registry
    pub path: String,
    /// Tag, if the reference carried one
    pub tag: Option<String>,
    /// Digest, if the reference carried one
    pub digest: Option<String>,
}

impl Reference {
    /// Parse an image reference in any of the familiar forms
    /// (`alpine`, `alpine:3`, `gcr.io/org/app@sha256:...`, `localhost:5000/app`).
    pub fn parse(name: &str) -> Self {
        let name = name.trim();

        let (rest, digest) = match name.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (name, None),
        };

        // The tag separator is the last colon after the last slash; an
        // earlier colon belongs to a registry port.
        let last_slash = rest.rfind('/');
        let (rest, tag) = match rest.rfind(':') {
            Some(idx) if last_slash.map_or(true, |slash| idx > slash) => {
                (&rest[..idx], Some(rest[idx + 1..].to_string()))
            }
            _ => (rest, None),
        };

        let (domain, path) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (normalize_hostname(first), remainder.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), rest.to_string()),
        };

        let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
            format!("{OFFICIAL_PREFIX}{path}")
        } else {
            path
        };

        Self {
            domain,
            path,
            tag: tag.filter(|t| !t.is_empty()),
            digest,
        }
    }

    /// Canonical name without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Tag, defaulting to `latest` when neither tag nor digest is present
    pub fn tag_or_default(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag.as_str()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = self.tag_or_default() {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Expand an image name to its fully qualified form (`docker.io/library/alpine:latest`)
pub fn expand(name: &str) -> String {
    Reference::parse(name).to_string()
}

/// Canonical image name with the tag and digest removed
pub fn trim(name: &str) -> String {
    Reference::parse(name).name()
}

/// Image tag, `latest` when the reference has none
pub fn tag(name: &str) -> String {
    Reference::parse(name)
        .tag_or_default()
        .unwrap_or_default()
        .to_string()
}

/// Whether the image resolves to the `latest` tag
pub fn is_latest(name: &str) -> bool {
    let reference = Reference::parse(name);
    reference.digest.is_none() && reference.tag_or_default() == Some(DEFAULT_TAG)
}

/// Whether the image matches any of the patterns, ignoring tags
pub fn matches<S: AsRef<str>>(image: &str, patterns: &[S]) -> bool {
    let from = trim(image);
    patterns.iter().any(|p| trim(p.as_ref()) == from)
}

/// Whether two images are the same including their tag
pub fn matches_tag(a: &str, b: &str) -> bool {
    expand(a) == expand(b)
}

/// Registry host of the image (`docker.io` for Docker Hub images)
pub fn hostname(image: &str) -> String {
    Reference::parse(image).domain
}

/// Whether the image is served from the given registry host
pub fn matches_hostname(image: &str, host: &str) -> bool {
    hostname(image) == normalize_hostname(host)
}

/// Normalise a registry address: drop scheme and path, fold Docker Hub aliases
pub fn normalize_hostname(address: &str) -> String {
    let address = address.trim();
    let address = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address);
    let host = address.split('/').next().unwrap_or(address).to_lowercase();

    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DEFAULT_DOMAIN.to_string()
    } else {
        host
    }
}
