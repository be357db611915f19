// Conditions
// `when` / `trigger` predicates evaluated against the build match tuple

use serde::{Deserialize, Deserializer, Serialize};

/// The build tuple conditions are evaluated against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    pub action: String,
    pub branch: String,
    pub cron: String,
    pub event: String,
    pub instance: String,
    pub reference: String,
    pub repo: String,
    pub target: String,
}

/// A set of per-field conditions; all non-empty fields must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conditions {
    pub action: Condition,
    pub branch: Condition,
    pub cron: Condition,
    pub event: Condition,
    pub instance: Condition,
    #[serde(rename = "ref")]
    pub reference: Condition,
    pub repo: Condition,
    pub status: Condition,
    pub target: Condition,
}

impl Conditions {
    /// Whether the build tuple satisfies every condition except `status`
    pub fn matches(&self, m: &Match) -> bool {
        self.action.matches(&m.action)
            && self.branch.matches(&m.branch)
            && self.cron.matches(&m.cron)
            && self.event.matches(&m.event)
            && self.instance.matches(&m.instance)
            && self.reference.matches(&m.reference)
            && self.repo.matches(&m.repo)
            && self.target.matches(&m.target)
    }

    /// Step runs whatever the upstream outcome
    pub fn runs_always(&self) -> bool {
        !self.status.is_empty() && self.status.matches("failure") && self.status.matches("success")
    }

    /// Step runs only after an upstream failure
    pub fn runs_on_failure(&self) -> bool {
        !self.status.is_empty() && self.status.matches("failure")
    }
}

/// Include and exclude glob patterns for a single field.
///
/// Deserializes from a string, a list of strings, or an
/// `{include, exclude}` mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Condition {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Condition {
    pub fn new(include: &[&str], exclude: &[&str]) -> Self {
        Self {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Whether the value passes this condition
    pub fn matches(&self, value: &str) -> bool {
        match (self.include.is_empty(), self.exclude.is_empty()) {
            (true, true) => true,
            (false, true) => self.includes(value),
            (true, false) => !self.excludes(value),
            (false, false) => self.includes(value) && !self.excludes(value),
        }
    }

    pub fn includes(&self, value: &str) -> bool {
        self.include.iter().any(|p| glob_match(p, value))
    }

    pub fn excludes(&self, value: &str) -> bool {
        self.exclude.iter().any(|p| glob_match(p, value))
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == value {
        return true;
    }
    glob::Pattern::new(pattern)
        .map(|p| p.matches(value))
        .unwrap_or(false)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCondition {
    One(String),
    Many(Vec<String>),
    Full {
        #[serde(default)]
        include: StringOrList,
        #[serde(default)]
        exclude: StringOrList,
    },
}

#[derive(Default, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    #[default]
    Empty,
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawCondition::deserialize(deserializer)? {
            RawCondition::One(s) => Self {
                include: vec![s],
                exclude: Vec::new(),
            },
            RawCondition::Many(include) => Self {
                include,
                exclude: Vec::new(),
            },
            RawCondition::Full { include, exclude } => Self {
                include: include.into_vec(),
                exclude: exclude.into_vec(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_forms() {
        let c: Condition = serde_yaml::from_str("push").unwrap();
        assert_eq!(c.include, vec!["push"]);

        let c: Condition = serde_yaml::from_str("[push, tag]").unwrap();
        assert_eq!(c.include, vec!["push", "tag"]);

        let c: Condition = serde_yaml::from_str("exclude: [pull_request]").unwrap();
        assert!(c.include.is_empty());
        assert_eq!(c.exclude, vec!["pull_request"]);

        let c: Condition = serde_yaml::from_str("include: main\nexclude: [dev]").unwrap();
        assert_eq!(c.include, vec!["main"]);
    }

    #[test]
    fn test_condition_matching() {
        let c = Condition::new(&["release/*"], &["release/old"]);
        assert!(c.matches("release/v1"));
        assert!(!c.matches("release/old"));
        assert!(!c.matches("main"));

        let c = Condition::new(&[], &["feature-*"]);
        assert!(c.matches("main"));
        assert!(!c.matches("feature-x"));

        assert!(Condition::default().matches("anything"));
    }

    #[test]
    fn test_conditions_against_match() {
        let when: Conditions = serde_yaml::from_str("branch: main\nevent: [push, tag]").unwrap();
        let mut m = Match {
            branch: "main".to_string(),
            event: "push".to_string(),
            ..Default::default()
        };
        assert!(when.matches(&m));

        m.event = "pull_request".to_string();
        assert!(!when.matches(&m));
    }

    #[test]
    fn test_status_policies() {
        let when: Conditions = serde_yaml::from_str("status: [failure]").unwrap();
        assert!(when.runs_on_failure());
        assert!(!when.runs_always());

        let when: Conditions = serde_yaml::from_str("status: [success, failure]").unwrap();
        assert!(when.runs_always());

        let when = Conditions::default();
        assert!(!when.runs_always());
        assert!(!when.runs_on_failure());
    }
}
