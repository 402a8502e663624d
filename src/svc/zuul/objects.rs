//! # Objects module
//!
//! This module build the kubernetes workloads and services of a zuul
//! deployment from the normalized instance

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec},
        core::v1::{
            Container, ContainerPort, LocalObjectReference, PodSpec, PodTemplateSpec,
            SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::api::ObjectMeta;

use crate::svc::zuul::{conf, launcher, Instance};

// -----------------------------------------------------------------------------
// constants

pub const CHECKSUM_ANNOTATION: &str = "operator.zuul-ci.org/config-checksum";

pub const SCHEDULER_COMPONENT: &str = "zuul-scheduler";
pub const EXECUTOR_COMPONENT: &str = "zuul-executor";
pub const MERGER_COMPONENT: &str = "zuul-merger";
pub const WEB_COMPONENT: &str = "zuul-web";
pub const FINGERGW_COMPONENT: &str = "zuul-fingergw";
pub const REGISTRY_COMPONENT: &str = "zuul-registry";
pub const LAUNCHER_COMPONENT: &str = "nodepool-launcher";

pub const REGISTRY_CONFIG_SECRET: &str = "zuul-registry-config";
pub const REGISTRY_USER_SECRET: &str = "zuul-registry-user-rw";
pub const REGISTRY_TLS_SECRET: &str = "zuul-registry-tls";

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the identifying labels of a zuul component, the selector of every
/// workload and the live reconfiguration pod lookup rely on them
pub fn labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "zuul".to_string()),
        ("app.kubernetes.io/instance".to_string(), instance.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
        ("app.kubernetes.io/part-of".to_string(), "zuul".to_string()),
    ])
}

/// returns the identifying labels of a launcher shard, the provider label is
/// read back during garbage collection
pub fn launcher_labels(instance: &str, provider: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "nodepool".to_string()),
        ("app.kubernetes.io/instance".to_string(), instance.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            LAUNCHER_COMPONENT.to_string(),
        ),
        ("app.kubernetes.io/part-of".to_string(), "zuul".to_string()),
    ]);

    labels.insert(launcher::PROVIDER_LABEL.to_string(), provider.to_string());
    labels
}

fn metadata(
    instance: &Instance,
    name: &str,
    labels: BTreeMap<String, String>,
    owner: &OwnerReference,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(instance.namespace.to_owned()),
        labels: Some(labels),
        owner_references: Some(vec![owner.to_owned()]),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// volumes every zuul component mounts, the rendered configuration, the
/// zookeeper client certificate and the connection secrets
fn common_volumes(instance: &Instance) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![
        secret_volume("zuul-config", conf::CONFIG_SECRET),
        secret_volume("zookeeper-client-tls", &instance.zk_secret),
    ];

    let mut mounts = vec![
        mount("zuul-config", "/etc/zuul"),
        mount("zookeeper-client-tls", "/tls/client"),
    ];

    for (name, connection) in &instance.spec.connections {
        if let Some(secret) = &connection.secret_name {
            let volume = format!("connection-{name}");

            volumes.push(secret_volume(&volume, secret));
            mounts.push(mount(&volume, &format!("/etc/zuul/connections/{name}")));
        }
    }

    (volumes, mounts)
}

fn image_pull_secrets(instance: &Instance) -> Option<Vec<LocalObjectReference>> {
    instance.spec.image_pull_secrets.as_ref().map(|secrets| {
        secrets
            .iter()
            .map(|secret| LocalObjectReference {
                name: Some(secret.secret_name.to_owned()),
            })
            .collect()
    })
}

fn pod_template(
    instance: &Instance,
    labels: BTreeMap<String, String>,
    checksum: &str,
    pod: PodSpec,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                CHECKSUM_ANNOTATION.to_string(),
                checksum.to_string(),
            )])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            image_pull_secrets: image_pull_secrets(instance),
            ..pod
        }),
    }
}

// -----------------------------------------------------------------------------
// Scheduler

pub fn scheduler_statefulset(
    instance: &Instance,
    checksum: &str,
    owner: &OwnerReference,
) -> StatefulSet {
    let labels = labels(&instance.name, SCHEDULER_COMPONENT);
    let (mut volumes, mut mounts) = common_volumes(instance);

    volumes.push(secret_volume("tenant-config", &instance.tenant_secret));
    mounts.push(mount("tenant-config", "/etc/zuul/tenant"));

    let container = Container {
        name: SCHEDULER_COMPONENT.to_string(),
        image: Some(instance.zuul_image("zuul-scheduler")),
        command: Some(vec![
            "zuul-scheduler".to_string(),
            "-f".to_string(),
            "-d".to_string(),
        ]),
        env: Some(instance.normalized_env(&[])),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    StatefulSet {
        metadata: metadata(instance, SCHEDULER_COMPONENT, labels.to_owned(), owner),
        spec: Some(StatefulSetSpec {
            service_name: SCHEDULER_COMPONENT.to_string(),
            replicas: Some(instance.spec.scheduler.count.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            template: pod_template(
                instance,
                labels,
                checksum,
                PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Executor

pub fn executor_statefulset(
    instance: &Instance,
    checksum: &str,
    owner: &OwnerReference,
) -> StatefulSet {
    let labels = labels(&instance.name, EXECUTOR_COMPONENT);
    let (mut volumes, mut mounts) = common_volumes(instance);
    let executor = instance.spec.executor.to_owned().unwrap_or_default();

    if let Some(sshkey) = &executor.sshkey {
        volumes.push(secret_volume("sshkey", &sshkey.secret_name));
        mounts.push(mount("sshkey", "/etc/zuul/sshkey"));
    }

    let container = Container {
        name: EXECUTOR_COMPONENT.to_string(),
        image: Some(instance.zuul_image("zuul-executor")),
        command: Some(vec![
            "zuul-executor".to_string(),
            "-f".to_string(),
            "-d".to_string(),
        ]),
        env: Some(instance.normalized_env(executor.env.as_deref().unwrap_or_default())),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    StatefulSet {
        metadata: metadata(instance, EXECUTOR_COMPONENT, labels.to_owned(), owner),
        spec: Some(StatefulSetSpec {
            service_name: EXECUTOR_COMPONENT.to_string(),
            replicas: Some(executor.count.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            template: pod_template(
                instance,
                labels,
                checksum,
                PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    termination_grace_period_seconds: executor
                        .termination_grace_period_seconds,
                    ..Default::default()
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Stateless components

/// returns the deployment of a stateless zuul component, the merger, web and
/// finger gateway tiers share the same shape
pub fn component_deployment(
    instance: &Instance,
    component: &str,
    command: &str,
    count: i32,
    env: &[crate::svc::crd::EnvValue],
    checksum: &str,
    owner: &OwnerReference,
) -> Deployment {
    let labels = labels(&instance.name, component);
    let (volumes, mounts) = common_volumes(instance);

    let container = Container {
        name: component.to_string(),
        image: Some(instance.zuul_image(command)),
        command: Some(vec![command.to_string(), "-f".to_string(), "-d".to_string()]),
        env: Some(instance.normalized_env(env)),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Deployment {
        metadata: metadata(instance, component, labels.to_owned(), owner),
        spec: Some(DeploymentSpec {
            replicas: Some(count),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            template: pod_template(
                instance,
                labels,
                checksum,
                PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns the service in front of a component
pub fn component_service(
    instance: &Instance,
    component: &str,
    port: i32,
    owner: &OwnerReference,
) -> Service {
    let labels = labels(&instance.name, component);

    Service {
        metadata: metadata(instance, component, labels.to_owned(), owner),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(component.to_string()),
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Registry

pub fn registry_statefulset(instance: &Instance, owner: &OwnerReference) -> StatefulSet {
    let labels = labels(&instance.name, REGISTRY_COMPONENT);
    let registry = instance.spec.registry.to_owned().unwrap_or_default();

    let tls_secret = registry
        .tls
        .and_then(|tls| tls.secret_name)
        .unwrap_or_else(|| REGISTRY_TLS_SECRET.to_string());

    let container = Container {
        name: REGISTRY_COMPONENT.to_string(),
        image: Some(instance.registry_image()),
        command: Some(vec![
            "zuul-registry".to_string(),
            "-c".to_string(),
            "/conf/registry.yaml".to_string(),
            "serve".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("registry".to_string()),
            container_port: 9000,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount("registry-config", "/conf"),
            mount("registry-tls", "/tls"),
        ]),
        ..Default::default()
    };

    StatefulSet {
        metadata: metadata(instance, REGISTRY_COMPONENT, labels.to_owned(), owner),
        spec: Some(StatefulSetSpec {
            service_name: REGISTRY_COMPONENT.to_string(),
            replicas: Some(registry.count.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    image_pull_secrets: image_pull_secrets(instance),
                    containers: vec![container],
                    volumes: Some(vec![
                        secret_volume("registry-config", REGISTRY_CONFIG_SECRET),
                        secret_volume("registry-tls", &tls_secret),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Launcher shards

pub fn launcher_deployment(
    instance: &Instance,
    provider: &str,
    secret_name: &str,
    owner: &OwnerReference,
) -> Deployment {
    let labels = launcher_labels(&instance.name, provider);

    let mut volumes = vec![
        secret_volume("nodepool-config", secret_name),
        secret_volume("zookeeper-client-tls", &instance.zk_secret),
    ];
    let mut mounts = vec![
        mount("nodepool-config", "/etc/nodepool"),
        mount("zookeeper-client-tls", "/tls/client"),
    ];

    // external cloud credentials, mounted where the provider drivers expect
    // them
    if let Some(external) = &instance.spec.external_config {
        for (name, secret) in external {
            let volume = format!("external-{name}");

            volumes.push(secret_volume(&volume, &secret.secret_name));
            mounts.push(mount(&volume, &format!("/etc/{name}")));
        }
    }

    let container = Container {
        name: LAUNCHER_COMPONENT.to_string(),
        image: Some(instance.nodepool_image("nodepool-launcher")),
        command: Some(vec![
            "nodepool-launcher".to_string(),
            "-f".to_string(),
            "-d".to_string(),
        ]),
        env: Some(instance.normalized_env(&[])),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Deployment {
        metadata: metadata(
            instance,
            &launcher::launcher_deployment_name(&instance.name, provider),
            labels.to_owned(),
            owner,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    image_pull_secrets: image_pull_secrets(instance),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use serde_json::json;

    use crate::svc::zuul::{objects::CHECKSUM_ANNOTATION, Instance};

    use super::{
        component_deployment, executor_statefulset, labels, launcher_deployment,
        scheduler_statefulset,
    };

    fn instance() -> Instance {
        let spec = serde_json::from_value(json!({
            "scheduler": {"config": {"secretName": "zuul-tenant-config"}},
            "launcher": {"config": {"secretName": "nodepool-config"}},
            "executor": {
                "count": 2,
                "sshkey": {"secretName": "executor-ssh"},
                "terminationGracePeriodSeconds": 120,
            },
            "connections": {
                "gerrit": {"secretName": "gerrit-secrets", "driver": "gerrit"}
            },
        }))
        .expect("specification to deserialize");

        Instance::normalize("zuul", "ci", spec)
    }

    #[test]
    fn scheduler_carries_the_checksum_annotation() {
        let owner = OwnerReference::default();
        let obj = scheduler_statefulset(&instance(), "abc123", &owner);

        let spec = obj.spec.expect("statefulset spec to be set");
        let annotations = spec
            .template
            .metadata
            .and_then(|meta| meta.annotations)
            .expect("pod template annotations to be set");

        assert_eq!(
            annotations.get(CHECKSUM_ANNOTATION).map(String::as_str),
            Some("abc123")
        );
    }

    #[test]
    fn scheduler_mounts_the_tenant_configuration() {
        let owner = OwnerReference::default();
        let obj = scheduler_statefulset(&instance(), "abc123", &owner);

        let pod = obj
            .spec
            .and_then(|spec| spec.template.spec)
            .expect("pod spec to be set");
        let mounts = pod.containers[0]
            .volume_mounts
            .to_owned()
            .expect("volume mounts to be set");

        assert!(mounts.iter().any(|mount| mount.mount_path == "/etc/zuul"));
        assert!(mounts
            .iter()
            .any(|mount| mount.mount_path == "/etc/zuul/tenant"));
        assert!(mounts
            .iter()
            .any(|mount| mount.mount_path == "/etc/zuul/connections/gerrit"));
    }

    #[test]
    fn executor_honors_ssh_key_and_grace_period() {
        let owner = OwnerReference::default();
        let obj = executor_statefulset(&instance(), "abc123", &owner);

        let spec = obj.spec.expect("statefulset spec to be set");
        assert_eq!(spec.replicas, Some(2));

        let pod = spec.template.spec.expect("pod spec to be set");
        assert_eq!(pod.termination_grace_period_seconds, Some(120));

        let mounts = pod.containers[0]
            .volume_mounts
            .to_owned()
            .expect("volume mounts to be set");
        assert!(mounts
            .iter()
            .any(|mount| mount.mount_path == "/etc/zuul/sshkey"));
    }

    #[test]
    fn component_deployment_uses_the_component_selector() {
        let owner = OwnerReference::default();
        let instance = instance();
        let obj =
            component_deployment(&instance, "zuul-web", "zuul-web", 3, &[], "abc123", &owner);

        let spec = obj.spec.expect("deployment spec to be set");
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.selector.match_labels,
            Some(labels("zuul", "zuul-web"))
        );
    }

    #[test]
    fn launcher_deployment_carries_the_provider_label() {
        let owner = OwnerReference::default();
        let obj = launcher_deployment(
            &instance(),
            "openstack",
            "nodepool-config-zuul-openstack",
            &owner,
        );

        assert_eq!(
            obj.metadata.name.as_deref(),
            Some("nodepool-launcher-zuul-openstack")
        );
        assert_eq!(
            obj.metadata
                .labels
                .expect("labels to be set")
                .get(crate::svc::zuul::launcher::PROVIDER_LABEL)
                .map(String::as_str),
            Some("openstack")
        );
    }
}
