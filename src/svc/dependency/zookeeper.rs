//! # Zookeeper module
//!
//! This module provide the zookeeper ensemble installation used as the
//! coordination backend of a zuul deployment

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
            PodSpec, PodTemplateSpec, ResourceRequirements, SecretVolumeSource, Service,
            ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
    },
};
use kube::{api::ObjectMeta, core::DynamicObject, Client};
use serde_json::json;
use tracing::info;

use crate::svc::k8s::{apply, poll, resource};

// -----------------------------------------------------------------------------
// constants

pub const SERVICE_NAME: &str = "zookeeper";
pub const CLIENT_PORT: i32 = 2281;
pub const SERVER_TLS_SECRET: &str = "zookeeper-server-tls";
pub const CLIENT_TLS_SECRET: &str = "zookeeper-client-tls";

const REPLICAS: i32 = 3;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to apply zookeeper certificate, {0}")]
    Apply(apply::Error),
    #[error("failed to serialize zookeeper certificate, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    Request(kube::Error),
    #[error("failed to wait for zookeeper ensemble, {0}")]
    Wait(poll::Error),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the default client connection string for the given namespace
pub fn default_hosts(namespace: &str) -> String {
    format!("{SERVICE_NAME}.{namespace}:{CLIENT_PORT}")
}

/// create the zookeeper ensemble, its services and the certificates securing
/// client and quorum traffic
pub async fn create(client: &Client, namespace: &str, owner: &OwnerReference) -> Result<(), Error> {
    info!(namespace = namespace, "create zookeeper ensemble");

    for certificate in certificates(namespace) {
        let obj: DynamicObject = serde_json::from_value(certificate).map_err(Error::Serialize)?;

        apply::object(client, obj, Some(namespace), Some(owner))
            .await
            .map_err(Error::Apply)?;
    }

    resource::upsert(client.to_owned(), &service(namespace, owner, false))
        .await
        .map_err(Error::Request)?;

    resource::upsert(client.to_owned(), &service(namespace, owner, true))
        .await
        .map_err(Error::Request)?;

    resource::upsert(client.to_owned(), &statefulset(namespace, owner))
        .await
        .map_err(Error::Request)?;

    Ok(())
}

/// wait for the three members of the ensemble to be running
pub async fn wait_for_cluster(
    client: &Client,
    namespace: &str,
    poller: &poll::Poller,
) -> Result<(), Error> {
    let selector = resource::selector(&[("app", SERVICE_NAME), ("component", "server")]);

    poll::wait_for_pods(client, namespace, &selector, REPLICAS as usize, poller)
        .await
        .map_err(Error::Wait)
}

/// returns the certificates securing the ensemble, both are issued by the
/// certificate authority of the instance
fn certificates(namespace: &str) -> Vec<serde_json::Value> {
    vec![
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {
                "name": SERVER_TLS_SECRET,
                "namespace": namespace,
            },
            "spec": {
                "secretName": SERVER_TLS_SECRET,
                "commonName": SERVICE_NAME,
                "dnsNames": [
                    SERVICE_NAME,
                    format!("{SERVICE_NAME}.{namespace}"),
                    format!("*.{SERVICE_NAME}-headless.{namespace}.svc.cluster.local"),
                ],
                "usages": ["server auth", "client auth"],
                "issuerRef": {
                    "name": "ca-issuer",
                    "kind": "Issuer",
                    "group": "cert-manager.io",
                },
            },
        }),
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {
                "name": CLIENT_TLS_SECRET,
                "namespace": namespace,
            },
            "spec": {
                "secretName": CLIENT_TLS_SECRET,
                "commonName": "client",
                "usages": ["client auth"],
                "issuerRef": {
                    "name": "ca-issuer",
                    "kind": "Issuer",
                    "group": "cert-manager.io",
                },
            },
        }),
    ]
}

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), SERVICE_NAME.to_string()),
        ("component".to_string(), "server".to_string()),
    ])
}

/// returns the client service, or the headless variant used by the ensemble
/// members to form the quorum
fn service(namespace: &str, owner: &OwnerReference, headless: bool) -> Service {
    let name = if headless {
        format!("{SERVICE_NAME}-headless")
    } else {
        SERVICE_NAME.to_string()
    };

    let ports = if headless {
        vec![
            ServicePort {
                name: Some("server".to_string()),
                port: 2888,
                ..Default::default()
            },
            ServicePort {
                name: Some("leader-election".to_string()),
                port: 3888,
                ..Default::default()
            },
        ]
    } else {
        vec![ServicePort {
            name: Some("client".to_string()),
            port: CLIENT_PORT,
            ..Default::default()
        }]
    };

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            owner_references: Some(vec![owner.to_owned()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: headless.then(|| "None".to_string()),
            selector: Some(labels()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn statefulset(namespace: &str, owner: &OwnerReference) -> StatefulSet {
    // quorum and election traffic stays inside the ensemble, only the client
    // port is exposed through the service and it requires TLS
    let zoo_cfg_extra = [
        "secureClientPort=2281",
        "serverCnxnFactory=org.apache.zookeeper.server.NettyServerCnxnFactory",
        "ssl.keyStore.location=/tls/server/tls.pem",
        "ssl.trustStore.location=/tls/server/ca.pem",
        "sslQuorum=true",
        "ssl.quorum.keyStore.location=/tls/server/tls.pem",
        "ssl.quorum.trustStore.location=/tls/server/ca.pem",
        "4lw.commands.whitelist=srvr,stat",
    ]
    .join(" ");

    let container = Container {
        name: SERVICE_NAME.to_string(),
        image: Some("zookeeper:3.7.0".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            concat!(
                "cat /tls/server/tls.crt /tls/server/tls.key > /tls/server/tls.pem && ",
                "cp /tls/server/ca.crt /tls/server/ca.pem && ",
                "exec /docker-entrypoint.sh zkServer.sh start-foreground",
            )
            .to_string(),
        ]),
        env: Some(vec![
            EnvVar {
                name: "ZOO_CFG_EXTRA".to_string(),
                value: Some(zoo_cfg_extra),
                ..Default::default()
            },
            EnvVar {
                name: "ZOO_STANDALONE_ENABLED".to_string(),
                value: Some("false".to_string()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: CLIENT_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("server".to_string()),
                container_port: 2888,
                ..Default::default()
            },
            ContainerPort {
                name: Some("leader-election".to_string()),
                container_port: 3888,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "server-tls".to_string(),
                mount_path: "/tls/server".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            owner_references: Some(vec![owner.to_owned()]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: format!("{SERVICE_NAME}-headless"),
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "server-tls".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(SERVER_TLS_SECRET.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity("1G".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
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

    use super::{default_hosts, service, statefulset};

    #[test]
    fn default_hosts_points_to_the_namespaced_service() {
        assert_eq!(default_hosts("ci"), "zookeeper.ci:2281");
    }

    #[test]
    fn headless_service_has_no_cluster_ip() {
        let owner = OwnerReference::default();

        let headless = service("ci", &owner, true);
        assert_eq!(headless.metadata.name.as_deref(), Some("zookeeper-headless"));
        assert_eq!(
            headless.spec.and_then(|spec| spec.cluster_ip).as_deref(),
            Some("None")
        );

        let client = service("ci", &owner, false);
        assert_eq!(client.metadata.name.as_deref(), Some("zookeeper"));
        assert!(client.spec.and_then(|spec| spec.cluster_ip).is_none());
    }

    #[test]
    fn ensemble_runs_three_members() {
        let owner = OwnerReference::default();
        let obj = statefulset("ci", &owner);

        let spec = obj.spec.expect("statefulset spec to be set");
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "zookeeper-headless");
    }
}
