//! # Apply module
//!
//! This module provide a dynamic create-or-update primitive for objects whose
//! kind is only known at runtime, such as foreign custom resources and the
//! embedded installation bundles

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Api, Client, ResourceExt,
};
use serde::Deserialize;
use tracing::debug;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse document, {0}")]
    Parse(serde_yaml::Error),
    #[error("failed to parse document, missing api version and kind")]
    MissingKind,
    #[error("failed to apply object '{0}', missing name")]
    MissingName(String),
    #[error("failed to apply namespaced object '{0}', no namespace given")]
    MissingNamespace(String),
    #[error("failed to discover api resource for '{0}/{1}', {2}")]
    Discovery(String, String, kube::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    Request(kube::Error),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// apply every document of the given multi-document yaml text, see
/// [`object`] for the namespace, ownership and idempotence rules
pub async fn multidoc(
    client: &Client,
    text: &str,
    namespace: Option<&str>,
    owner: Option<&OwnerReference>,
) -> Result<(), Error> {
    // the deserializer is not `Send`, so drain it before awaiting; parse
    // errors are still propagated at the same position in the loop
    let documents = serde_yaml::Deserializer::from_str(text)
        .map(serde_yaml::Value::deserialize)
        .collect::<Vec<_>>();

    for document in documents {
        let value = document.map_err(Error::Parse)?;
        if value.is_null() {
            continue;
        }

        let obj: DynamicObject = serde_yaml::from_value(value).map_err(Error::Parse)?;

        object(client, obj, namespace, owner).await?;
    }

    Ok(())
}

/// create the object if it does not exist, merge-patch it otherwise. The
/// given namespace overrides the object's own, the given owner reference is
/// set on the object so that it is garbage-collected with its owner; objects
/// applied without an owner deliberately survive the owning instance
pub async fn object(
    client: &Client,
    mut obj: DynamicObject,
    namespace: Option<&str>,
    owner: Option<&OwnerReference>,
) -> Result<DynamicObject, Error> {
    let types = obj.types.to_owned().ok_or(Error::MissingKind)?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };

    let gvk = GroupVersionKind::gvk(group, version, &types.kind);
    let (api_resource, capabilities) = discovery::pinned_kind(client, &gvk)
        .await
        .map_err(|err| Error::Discovery(types.api_version.to_owned(), types.kind.to_owned(), err))?;

    let name = obj
        .metadata
        .name
        .to_owned()
        .ok_or_else(|| Error::MissingName(types.kind.to_owned()))?;

    if let Some(namespace) = namespace {
        obj.metadata.namespace = Some(namespace.to_string());
    }

    if let Some(owner) = owner {
        obj.metadata.owner_references = Some(vec![owner.to_owned()]);
    }

    let api: Api<DynamicObject> = if capabilities.scope == Scope::Cluster {
        Api::all_with(client.to_owned(), &api_resource)
    } else {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::MissingNamespace(name.to_owned()))?;

        Api::namespaced_with(client.to_owned(), &namespace, &api_resource)
    };

    if api.get_opt(&name).await.map_err(Error::Request)?.is_some() {
        debug!(
            kind = types.kind,
            name = name,
            "execute patch request on existing object"
        );
        return api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&obj))
            .await
            .map_err(Error::Request);
    }

    debug!(
        kind = types.kind,
        name = name,
        "execute creation request on object"
    );
    api.create(&PostParams::default(), &obj)
        .await
        .map_err(Error::Request)
}
