//! # Dependency module
//!
//! This module provide installers for the third-party services a zuul
//! deployment relies on, the certificate authority, the database cluster and
//! the zookeeper ensemble

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client};

pub mod certmanager;
pub mod pxc;
pub mod zookeeper;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns whether the custom resource definition of the given name is
/// already registered on the cluster
pub async fn crd_installed(client: &Client, name: &str) -> Result<bool, kube::Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.to_owned());

    Ok(api.get_opt(name).await?.is_some())
}
