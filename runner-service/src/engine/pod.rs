// Pod Builder
// Converts a compiled spec into namespace, secret and pod objects

use crate::ir::{Spec, Step, Volume};
use crate::manifest::units::{format_bytes, format_cpu};

use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Label carrying the pod name, used by the watcher's selector
pub const POD_NAME_LABEL: &str = "io.drone.name";

/// Annotation key recording a step's launch status
pub fn step_annotation(step_id: &str) -> String {
    format!("io.drone.step.{}", step_id)
}

pub fn label_selector(spec: &Spec) -> String {
    format!("{}={}", POD_NAME_LABEL, spec.pod_spec.name)
}

/// Secret object keys allow `[-._a-zA-Z0-9]` only
pub fn secret_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn namespace(spec: &Spec) -> Result<Namespace, serde_json::Error> {
    serde_json::from_value(json!({
        "metadata": {
            "name": spec.pod_spec.namespace,
            "labels": spec.pod_spec.labels,
        }
    }))
}

/// The secrets object backing every step secret reference
pub fn secret(spec: &Spec) -> Result<Secret, serde_json::Error> {
    let data: BTreeMap<String, String> = spec
        .secrets
        .values()
        .map(|s| (secret_key(&s.name), s.data.clone()))
        .collect();
    serde_json::from_value(json!({
        "metadata": {
            "name": spec.secret_object_name(),
            "namespace": spec.pod_spec.namespace,
            "labels": spec.pod_spec.labels,
        },
        "type": "Opaque",
        "stringData": data,
    }))
}

/// The image pull secret, when the compiler matched any registry credential
pub fn pull_secret(spec: &Spec) -> Result<Option<Secret>, serde_json::Error> {
    let Some(pull) = &spec.pull_secret else {
        return Ok(None);
    };
    serde_json::from_value(json!({
        "metadata": {
            "name": pull.name,
            "namespace": spec.pod_spec.namespace,
            "labels": spec.pod_spec.labels,
        },
        "type": "kubernetes.io/dockerconfigjson",
        "stringData": { ".dockerconfigjson": pull.data },
    }))
    .map(Some)
}

/// The stage pod; every container starts on its placeholder image
pub fn pod(spec: &Spec) -> Result<Pod, serde_json::Error> {
    let pod_spec = &spec.pod_spec;

    let mut volumes: Vec<Value> = spec.volumes.iter().map(volume).collect();
    let mut containers = Vec::with_capacity(spec.steps.len());
    for step in &spec.steps {
        let mut mounts: Vec<Value> = step
            .volumes
            .iter()
            .filter_map(|mount| {
                let id = spec.volumes.iter().find(|v| v.name() == mount.name)?.id();
                Some(json!({ "name": id, "mountPath": mount.path }))
            })
            .collect();
        if step.shm_size > 0 {
            let name = format!("shm-{}", step.id);
            volumes.push(json!({
                "name": name,
                "emptyDir": { "medium": "Memory", "sizeLimit": format_bytes(step.shm_size) },
            }));
            mounts.push(json!({ "name": name, "mountPath": "/dev/shm" }));
        }
        containers.push(container(spec, step, mounts));
    }

    let mut body = Map::new();
    body.insert("restartPolicy".into(), json!("Never"));
    body.insert("containers".into(), json!(containers));
    body.insert("volumes".into(), json!(volumes));
    if !pod_spec.node_selector.is_empty() {
        body.insert("nodeSelector".into(), json!(pod_spec.node_selector));
    }
    if !pod_spec.tolerations.is_empty() {
        let tolerations: Vec<Value> = pod_spec
            .tolerations
            .iter()
            .map(|t| {
                json!({
                    "key": non_empty(&t.key),
                    "operator": non_empty(&t.operator),
                    "value": non_empty(&t.value),
                    "effect": non_empty(&t.effect),
                    "tolerationSeconds": t.toleration_seconds,
                })
            })
            .collect();
        body.insert("tolerations".into(), json!(tolerations));
    }
    if !pod_spec.service_account_name.is_empty() {
        body.insert("serviceAccountName".into(), json!(pod_spec.service_account_name));
    }
    if let Some(dns) = &pod_spec.dns_config {
        body.insert(
            "dnsConfig".into(),
            json!({
                "nameservers": dns.nameservers,
                "searches": dns.searches,
                "options": dns.options,
            }),
        );
    }
    if !pod_spec.host_aliases.is_empty() {
        body.insert("hostAliases".into(), json!(pod_spec.host_aliases));
    }
    if let Some(pull) = &spec.pull_secret {
        body.insert("imagePullSecrets".into(), json!([{ "name": pull.name }]));
    }

    serde_json::from_value(json!({
        "metadata": {
            "name": pod_spec.name,
            "namespace": pod_spec.namespace,
            "labels": pod_spec.labels,
            "annotations": pod_spec.annotations,
        },
        "spec": Value::Object(body),
    }))
}

fn container(spec: &Spec, step: &Step, mounts: Vec<Value>) -> Value {
    let mut env: Vec<Value> = step
        .envs
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    for secret in &step.secrets {
        env.push(json!({
            "name": secret.env,
            "valueFrom": {
                "secretKeyRef": {
                    "name": spec.secret_object_name(),
                    "key": secret_key(&secret.name),
                }
            }
        }));
    }

    let mut container = Map::new();
    container.insert("name".into(), json!(step.id));
    container.insert("image".into(), json!(step.placeholder));
    if let Some(policy) = step.pull.as_kubernetes() {
        container.insert("imagePullPolicy".into(), json!(policy));
    }
    if !step.entrypoint.is_empty() {
        container.insert("command".into(), json!(step.entrypoint));
    }
    if !step.command.is_empty() {
        container.insert("args".into(), json!(step.command));
    }
    if !step.working_dir.is_empty() {
        container.insert("workingDir".into(), json!(step.working_dir));
    }
    container.insert("env".into(), json!(env));
    container.insert("volumeMounts".into(), json!(mounts));
    container.insert(
        "resources".into(),
        json!({
            "limits": quantities(step.resources.limits.cpu, step.resources.limits.memory),
            "requests": quantities(step.resources.requests.cpu, step.resources.requests.memory),
        }),
    );

    let mut security = Map::new();
    if step.privileged {
        security.insert("privileged".into(), json!(true));
    }
    if let Some(uid) = step.user {
        security.insert("runAsUser".into(), json!(uid));
    }
    if !security.is_empty() {
        container.insert("securityContext".into(), Value::Object(security));
    }

    Value::Object(container)
}

fn quantities(cpu: i64, memory: i64) -> Value {
    let mut out = Map::new();
    if cpu > 0 {
        out.insert("cpu".into(), json!(format_cpu(cpu)));
    }
    if memory > 0 {
        out.insert("memory".into(), json!(format_bytes(memory)));
    }
    Value::Object(out)
}

fn volume(volume: &Volume) -> Value {
    match volume {
        Volume::EmptyDir {
            id,
            medium,
            size_limit,
            ..
        } => {
            let mut dir = Map::new();
            if let Some(medium) = medium {
                dir.insert("medium".into(), json!(medium));
            }
            if let Some(limit) = size_limit {
                dir.insert("sizeLimit".into(), json!(format_bytes(*limit)));
            }
            json!({ "name": id, "emptyDir": Value::Object(dir) })
        }
        Volume::HostPath { id, path, .. } => {
            json!({ "name": id, "hostPath": { "path": path } })
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{PodSpec, PullPolicy, ResourceValues, Resources, Secret as SpecSecret, SecretVar, VolumeMount};

    fn spec() -> Spec {
        let mut spec = Spec {
            pod_spec: PodSpec {
                name: "drone-abc".to_string(),
                namespace: "drone-ns".to_string(),
                labels: BTreeMap::from([(POD_NAME_LABEL.to_string(), "drone-abc".to_string())]),
                ..Default::default()
            },
            volumes: vec![Volume::EmptyDir {
                id: "vol1".to_string(),
                name: "_workspace".to_string(),
                medium: None,
                size_limit: None,
            }],
            ..Default::default()
        };
        spec.secrets.insert(
            "docker/password".to_string(),
            SpecSecret {
                name: "docker/password".to_string(),
                data: "hunter2".to_string(),
                mask: true,
            },
        );
        spec.steps.push(Step {
            id: "step1".to_string(),
            name: "build".to_string(),
            image: "docker.io/library/golang:1.22".to_string(),
            placeholder: "docker.io/drone/placeholder:1".to_string(),
            pull: PullPolicy::IfNotExists,
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            command: vec!["echo \"$DRONE_SCRIPT\" | /bin/sh".to_string()],
            working_dir: "/drone/src".to_string(),
            envs: BTreeMap::from([("CI".to_string(), "true".to_string())]),
            secrets: vec![SecretVar {
                name: "docker/password".to_string(),
                env: "PASSWORD".to_string(),
            }],
            privileged: true,
            resources: Resources {
                limits: ResourceValues {
                    cpu: 500,
                    memory: 1 << 30,
                },
                ..Default::default()
            },
            shm_size: 64 << 20,
            volumes: vec![VolumeMount {
                name: "_workspace".to_string(),
                path: "/drone/src".to_string(),
            }],
            ..Default::default()
        });
        spec
    }

    #[test]
    fn test_pod_containers_start_on_placeholder() {
        let pod = pod(&spec()).unwrap();
        let body = pod.spec.unwrap();

        assert_eq!(body.restart_policy.as_deref(), Some("Never"));
        let container = &body.containers[0];
        assert_eq!(container.name, "step1");
        assert_eq!(container.image.as_deref(), Some("docker.io/drone/placeholder:1"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.command.as_ref().unwrap()[0], "/bin/sh");

        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, "vol1");
        assert_eq!(mounts[1].mount_path, "/dev/shm");

        let env = container.env.as_ref().unwrap();
        let password = env.iter().find(|e| e.name == "PASSWORD").unwrap();
        let key = &password.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap().key;
        assert_eq!(key, "docker_password");

        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        assert_eq!(body.volumes.unwrap().len(), 2);
    }

    #[test]
    fn test_secret_objects() {
        let spec = spec();
        let secret = secret(&spec).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("drone-abc"));
        assert_eq!(
            secret.string_data.unwrap().get("docker_password").map(String::as_str),
            Some("hunter2")
        );

        assert!(pull_secret(&spec).unwrap().is_none());
        assert_eq!(label_selector(&spec), "io.drone.name=drone-abc");
    }
}
