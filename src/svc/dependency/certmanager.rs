//! # Cert-manager module
//!
//! This module provide the cert-manager installation and the certificate
//! authority used to issue internal certificates

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{core::DynamicObject, Client};
use serde_json::json;
use tracing::info;

use crate::svc::k8s::{apply, poll, resource};

// -----------------------------------------------------------------------------
// constants

pub const CRD_NAME: &str = "certificaterequests.cert-manager.io";
pub const NAMESPACE: &str = "cert-manager";
pub const WEBHOOK_COMPONENT: &str = "webhook";

const BUNDLE: &str = include_str!("../../../manifests/cert-manager.yaml");

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to apply cert-manager manifests, {0}")]
    Apply(apply::Error),
    #[error("failed to serialize certificate authority object, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to wait for cert-manager webhook, {0}")]
    Wait(poll::Error),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// install the cert-manager operator, objects are applied without an owner so
/// that other deployments on the cluster keep using it
pub async fn install(client: &Client) -> Result<(), Error> {
    info!("install cert-manager manifests");

    apply::multidoc(client, BUNDLE, None, None)
        .await
        .map_err(Error::Apply)
}

/// wait for the cert-manager webhook to be up, certificates cannot be issued
/// before it answers admission requests
pub async fn wait(client: &Client, poller: &poll::Poller) -> Result<(), Error> {
    let selector = resource::selector(&[
        ("app.kubernetes.io/component", WEBHOOK_COMPONENT),
        ("app.kubernetes.io/instance", "cert-manager"),
    ]);

    poll::wait_for_pods(client, NAMESPACE, &selector, 1, poller)
        .await
        .map_err(Error::Wait)
}

/// create the self-signed certificate authority of the instance, a
/// self-signed issuer bootstraps the ca certificate which backs the ca issuer
/// handed to every other certificate
pub async fn create_ca(
    client: &Client,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<(), Error> {
    let documents = [
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Issuer",
            "metadata": {
                "name": "selfsigned-issuer",
                "namespace": namespace,
            },
            "spec": {
                "selfSigned": {},
            },
        }),
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {
                "name": "ca-cert",
                "namespace": namespace,
            },
            "spec": {
                "secretName": "ca-cert",
                "isCA": true,
                "commonName": "cacert",
                "issuerRef": {
                    "name": "selfsigned-issuer",
                    "kind": "Issuer",
                    "group": "cert-manager.io",
                },
            },
        }),
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Issuer",
            "metadata": {
                "name": "ca-issuer",
                "namespace": namespace,
            },
            "spec": {
                "ca": {
                    "secretName": "ca-cert",
                },
            },
        }),
    ];

    for document in documents {
        let obj: DynamicObject = serde_json::from_value(document).map_err(Error::Serialize)?;

        apply::object(client, obj, Some(namespace), Some(owner))
            .await
            .map_err(Error::Apply)?;
    }

    Ok(())
}
