// Coordinator Data Models
// Wire types exchanged with the coordination server

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a stage or step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Skipped,
    #[serde(rename = "success")]
    Passing,
    #[serde(rename = "failure")]
    Failing,
    Killed,
    Error,
    Blocked,
    Declined,
    #[serde(rename = "waiting_on_dependencies")]
    Waiting,
}

impl Status {
    /// Terminal statuses
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Passing | Self::Failing | Self::Killed | Self::Error | Self::Declined
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failing | Self::Killed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Passing => "success",
            Self::Failing => "failure",
            Self::Killed => "killed",
            Self::Error => "error",
            Self::Blocked => "blocked",
            Self::Declined => "declined",
            Self::Waiting => "waiting_on_dependencies",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work dispatched to a runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage {
    pub id: i64,
    pub repo_id: i64,
    pub build_id: i64,
    pub number: i64,
    pub name: String,
    pub kind: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub status: Status,
    pub error: String,
    pub errignore: bool,
    pub exit_code: i32,
    pub machine: String,
    pub os: String,
    pub arch: String,
    pub variant: String,
    pub kernel: String,
    pub limit: i64,
    pub started: i64,
    pub stopped: i64,
    pub created: i64,
    pub updated: i64,
    pub version: i64,
    pub on_success: bool,
    pub on_failure: bool,
    pub depends_on: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

/// A step of a stage as seen by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    pub id: i64,
    pub step_id: i64,
    pub number: i64,
    pub name: String,
    pub status: Status,
    pub error: String,
    pub errignore: bool,
    pub exit_code: i32,
    pub started: i64,
    pub stopped: i64,
    pub version: i64,
    pub depends_on: Vec<String>,
    pub image: String,
    pub detached: bool,
    pub schema: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Build {
    pub id: i64,
    pub repo_id: i64,
    pub trigger: String,
    pub number: i64,
    pub parent: i64,
    pub status: Status,
    pub error: String,
    pub event: String,
    pub action: String,
    pub link: String,
    pub timestamp: i64,
    pub title: String,
    pub message: String,
    pub before: String,
    pub after: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub source_repo: String,
    pub source: String,
    pub target: String,
    pub author_login: String,
    pub author_name: String,
    pub author_email: String,
    pub author_avatar: String,
    pub sender: String,
    pub params: BTreeMap<String, String>,
    pub cron: String,
    pub deploy_to: String,
    pub deploy_id: i64,
    pub debug: bool,
    pub started: i64,
    pub finished: i64,
    pub created: i64,
    pub updated: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repo {
    pub id: i64,
    pub uid: String,
    pub user_id: i64,
    pub namespace: String,
    pub name: String,
    pub slug: String,
    pub scm: String,
    pub git_http_url: String,
    pub git_ssh_url: String,
    pub link: String,
    pub default_branch: String,
    pub private: bool,
    pub visibility: String,
    pub active: bool,
    pub config_path: String,
    pub trusted: bool,
    pub protected: bool,
    pub ignore_forks: bool,
    pub ignore_pull_requests: bool,
    /// Stage timeout in minutes
    pub timeout: i64,
    pub counter: i64,
    pub synced: i64,
    pub created: i64,
    pub updated: i64,
    pub version: i64,
}

/// Coordinator installation details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct System {
    pub proto: String,
    pub host: String,
    pub link: String,
    pub version: String,
}

/// Git credentials for the clone step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Netrc {
    pub machine: String,
    pub login: String,
    pub password: String,
}

/// A repository secret shipped with the stage details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Secret {
    pub name: String,
    pub data: String,
    pub pull_request: bool,
}

/// Raw pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: String,
}

/// Everything needed to run an accepted stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    pub build: Build,
    pub repo: Repo,
    pub stage: Stage,
    pub system: System,
    pub netrc: Option<Netrc>,
    pub secrets: Vec<Secret>,
    pub config: Config,
}

/// Criteria used when requesting work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub kind: String,
    #[serde(rename = "type")]
    pub filter_type: String,
    pub os: String,
    pub arch: String,
    pub variant: String,
    pub kernel: String,
    pub labels: BTreeMap<String, String>,
}

/// A single line of step output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Line {
    #[serde(rename = "pos")]
    pub number: i64,
    #[serde(rename = "out")]
    pub message: String,
    /// Seconds since the step started
    #[serde(rename = "time")]
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&Status::Passing).unwrap(), r#""success""#);
        assert_eq!(serde_json::to_string(&Status::Failing).unwrap(), r#""failure""#);
        let status: Status = serde_json::from_str(r#""killed""#).unwrap();
        assert_eq!(status, Status::Killed);
        assert_eq!(Status::Waiting.to_string(), "waiting_on_dependencies");
    }

    #[test]
    fn test_context_tolerates_missing_fields() {
        let ctx: Context = serde_json::from_str(
            r#"{"build":{"number":4,"ref":"refs/heads/main"},"repo":{"slug":"octocat/hello"},"netrc":null}"#,
        )
        .unwrap();
        assert_eq!(ctx.build.number, 4);
        assert_eq!(ctx.build.reference, "refs/heads/main");
        assert_eq!(ctx.repo.slug, "octocat/hello");
        assert!(ctx.netrc.is_none());
        assert!(ctx.secrets.is_empty());
    }

    #[test]
    fn test_line_wire_names() {
        let line = Line {
            number: 1,
            message: "hello\n".to_string(),
            timestamp: 2,
        };
        assert_eq!(
            serde_json::to_string(&line).unwrap(),
            r#"{"pos":1,"out":"hello\n","time":2}"#
        );
    }
}
