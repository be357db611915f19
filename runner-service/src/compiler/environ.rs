// Environment Builders
// Produces the DRONE_* variables exposed to every step

use crate::coordinator::models::{Build, Netrc, Repo, Stage, System};

use std::collections::BTreeMap;

type Environ = BTreeMap<String, String>;

fn env<const N: usize>(pairs: [(&str, String); N]) -> Environ {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Proxy variables inherited from the host, in both cases
pub fn proxy() -> Environ {
    let mut environ = Environ::new();
    for name in ["no_proxy", "http_proxy", "https_proxy"] {
        let value = std::env::var(name)
            .or_else(|_| std::env::var(name.to_uppercase()))
            .unwrap_or_default();
        if !value.is_empty() {
            environ.insert(name.to_string(), value.clone());
            environ.insert(name.to_uppercase(), value);
        }
    }
    environ
}

pub fn system(system: &System) -> Environ {
    env([
        ("CI", "true".to_string()),
        ("DRONE", "true".to_string()),
        ("DRONE_SYSTEM_PROTO", system.proto.clone()),
        ("DRONE_SYSTEM_HOST", system.host.clone()),
        ("DRONE_SYSTEM_HOSTNAME", system.host.clone()),
        ("DRONE_SYSTEM_VERSION", system.version.clone()),
    ])
}

pub fn repo(repo: &Repo) -> Environ {
    env([
        ("DRONE_REPO", repo.slug.clone()),
        ("DRONE_REPO_SCM", repo.scm.clone()),
        ("DRONE_REPO_OWNER", repo.namespace.clone()),
        ("DRONE_REPO_NAMESPACE", repo.namespace.clone()),
        ("DRONE_REPO_NAME", repo.name.clone()),
        ("DRONE_REPO_LINK", repo.link.clone()),
        ("DRONE_REPO_BRANCH", repo.default_branch.clone()),
        ("DRONE_REMOTE_URL", repo.git_http_url.clone()),
        ("DRONE_GIT_HTTP_URL", repo.git_http_url.clone()),
        ("DRONE_GIT_SSH_URL", repo.git_ssh_url.clone()),
        ("DRONE_REPO_VISIBILITY", repo.visibility.clone()),
        ("DRONE_REPO_PRIVATE", repo.private.to_string()),
    ])
}

pub fn stage(stage: &Stage) -> Environ {
    env([
        ("DRONE_STAGE_KIND", stage.kind.clone()),
        ("DRONE_STAGE_TYPE", stage.stage_type.clone()),
        ("DRONE_STAGE_NAME", stage.name.clone()),
        ("DRONE_STAGE_NUMBER", stage.number.to_string()),
        ("DRONE_STAGE_MACHINE", stage.machine.clone()),
        ("DRONE_STAGE_OS", stage.os.clone()),
        ("DRONE_STAGE_ARCH", stage.arch.clone()),
        ("DRONE_STAGE_VARIANT", stage.variant.clone()),
        ("DRONE_STAGE_DEPENDS_ON", stage.depends_on.join(",")),
    ])
}

pub fn build(build: &Build) -> Environ {
    let mut environ = env([
        ("DRONE_BRANCH", build.target.clone()),
        ("DRONE_SOURCE_BRANCH", build.source.clone()),
        ("DRONE_TARGET_BRANCH", build.target.clone()),
        ("DRONE_COMMIT", build.after.clone()),
        ("DRONE_COMMIT_SHA", build.after.clone()),
        ("DRONE_COMMIT_BEFORE", build.before.clone()),
        ("DRONE_COMMIT_AFTER", build.after.clone()),
        ("DRONE_COMMIT_REF", build.reference.clone()),
        ("DRONE_COMMIT_BRANCH", build.target.clone()),
        ("DRONE_COMMIT_LINK", build.link.clone()),
        ("DRONE_COMMIT_MESSAGE", build.message.clone()),
        ("DRONE_COMMIT_AUTHOR", build.author_login.clone()),
        ("DRONE_COMMIT_AUTHOR_EMAIL", build.author_email.clone()),
        ("DRONE_COMMIT_AUTHOR_AVATAR", build.author_avatar.clone()),
        ("DRONE_COMMIT_AUTHOR_NAME", build.author_name.clone()),
        ("DRONE_BUILD_NUMBER", build.number.to_string()),
        ("DRONE_BUILD_PARENT", build.parent.to_string()),
        ("DRONE_BUILD_EVENT", build.event.clone()),
        ("DRONE_BUILD_ACTION", build.action.clone()),
        ("DRONE_BUILD_CREATED", build.created.to_string()),
        ("DRONE_BUILD_STARTED", build.started.to_string()),
        ("DRONE_BUILD_FINISHED", build.finished.to_string()),
        ("DRONE_BUILD_TRIGGER", build.trigger.clone()),
        ("DRONE_DEPLOY_TO", build.deploy_to.clone()),
    ]);

    if let Some(tag) = build.reference.strip_prefix("refs/tags/") {
        environ.insert("DRONE_TAG".to_string(), tag.to_string());
        environ.insert(
            "DRONE_SEMVER".to_string(),
            tag.strip_prefix('v').unwrap_or(tag).to_string(),
        );
    }
    if let Some(rest) = build.reference.strip_prefix("refs/pull/") {
        let number = rest.split('/').next().unwrap_or_default();
        environ.insert("DRONE_PULL_REQUEST".to_string(), number.to_string());
        environ.insert("DRONE_PULL_REQUEST_TITLE".to_string(), build.title.clone());
    }
    if !build.cron.is_empty() {
        environ.insert("DRONE_CRON".to_string(), build.cron.clone());
    }
    for (k, v) in &build.params {
        environ.insert(k.clone(), v.clone());
    }

    environ
}

/// Link to the build in the coordinator UI
pub fn link(repo: &Repo, build: &Build, system: &System) -> Environ {
    env([(
        "DRONE_BUILD_LINK",
        format!(
            "{}://{}/{}/{}",
            system.proto, system.host, repo.slug, build.number
        ),
    )])
}

pub fn netrc(netrc: &Netrc) -> Environ {
    env([
        ("DRONE_NETRC_MACHINE", netrc.machine.clone()),
        ("DRONE_NETRC_USERNAME", netrc.login.clone()),
        ("DRONE_NETRC_PASSWORD", netrc.password.clone()),
        ("DRONE_NETRC_FILE", format!(
            "machine {} login {} password {}",
            netrc.machine, netrc.login, netrc.password
        )),
    ])
}

pub fn workspace(base: &str, path: &str, full: &str) -> Environ {
    env([
        ("DRONE_WORKSPACE", full.to_string()),
        ("DRONE_WORKSPACE_BASE", base.to_string()),
        ("DRONE_WORKSPACE_PATH", path.to_string()),
    ])
}

/// Variables that change while the stage runs, overlaid on each step
pub fn step_overlay(
    build_status: &str,
    stage_status: &str,
    step_name: &str,
    step_number: i64,
    failed_steps: &[String],
) -> Environ {
    let now = chrono::Utc::now().timestamp().to_string();
    env([
        ("DRONE_BUILD_STATUS", build_status.to_string()),
        ("DRONE_STAGE_STATUS", stage_status.to_string()),
        ("DRONE_STAGE_FINISHED", now.clone()),
        ("DRONE_BUILD_FINISHED", now),
        ("DRONE_STEP_NAME", step_name.to_string()),
        ("DRONE_STEP_NUMBER", step_number.to_string()),
        ("DRONE_FAILED_STEPS", failed_steps.join(",")),
    ])
}

/// Merge several environments; later maps win
pub fn combine<'a>(maps: impl IntoIterator<Item = &'a Environ>) -> Environ {
    let mut out = Environ::new();
    for map in maps {
        out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tag_and_pull_request() {
        let tagged = Build {
            reference: "refs/tags/v1.2.3".to_string(),
            ..Default::default()
        };
        let environ = build(&tagged);
        assert_eq!(environ["DRONE_TAG"], "v1.2.3");
        assert_eq!(environ["DRONE_SEMVER"], "1.2.3");

        let pull = Build {
            reference: "refs/pull/42/head".to_string(),
            ..Default::default()
        };
        assert_eq!(build(&pull)["DRONE_PULL_REQUEST"], "42");
    }

    #[test]
    fn test_link() {
        let system = System {
            proto: "https".to_string(),
            host: "drone.company.com".to_string(),
            ..Default::default()
        };
        let repo = Repo {
            slug: "octocat/hello".to_string(),
            ..Default::default()
        };
        let build = Build {
            number: 7,
            ..Default::default()
        };
        assert_eq!(
            link(&repo, &build, &system)["DRONE_BUILD_LINK"],
            "https://drone.company.com/octocat/hello/7"
        );
    }

    #[test]
    fn test_combine_later_wins() {
        let a = env([("A", "1".to_string()), ("B", "1".to_string())]);
        let b = env([("B", "2".to_string())]);
        let merged = combine([&a, &b]);
        assert_eq!(merged["A"], "1");
        assert_eq!(merged["B"], "2");
    }
}
