//! # Secret module
//!
//! This module provide helpers to read and persist kubernetes secrets

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference};
use kube::{api::ObjectMeta, Api, Client};
use tracing::debug;

use crate::svc::k8s::resource;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns a secret holding the given textual entries, owned by the given
/// owner when provided
pub fn string_data(
    namespace: &str,
    name: &str,
    owner: Option<&OwnerReference>,
    entries: BTreeMap<String, String>,
) -> Secret {
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        owner_references: owner.map(|owner| vec![owner.to_owned()]),
        ..Default::default()
    };

    Secret {
        metadata,
        string_data: Some(entries),
        ..Default::default()
    }
}

/// returns the secret of the given name, "does not exist" is a distinguished
/// non-fatal condition mapped to [`None`]
pub async fn find(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Secret>, kube::Error> {
    let api: Api<Secret> = Api::namespaced(client, namespace);

    debug!(
        namespace = namespace,
        name = name,
        "execute a request to retrieve secret"
    );
    api.get_opt(name).await
}

/// returns the payload of the given key, the kubernetes client already
/// base64-decodes secret data
pub fn data(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.to_owned())
}

/// create or update the secret holding the given textual entries
pub async fn upsert(
    client: Client,
    namespace: &str,
    name: &str,
    owner: Option<&OwnerReference>,
    entries: BTreeMap<String, String>,
) -> Result<Secret, kube::Error> {
    let secret = string_data(namespace, name, owner, entries);

    resource::upsert(client, &secret).await
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;

    use super::{data, string_data};

    #[test]
    fn string_data_builds_a_namespaced_secret() {
        let secret = string_data(
            "ci",
            "zuul-config",
            None,
            BTreeMap::from([("zuul.conf".to_string(), "[scheduler]".to_string())]),
        );

        assert_eq!(secret.metadata.namespace.as_deref(), Some("ci"));
        assert_eq!(secret.metadata.name.as_deref(), Some("zuul-config"));
        assert_eq!(
            secret
                .string_data
                .expect("string data to be set")
                .get("zuul.conf")
                .map(String::as_str),
            Some("[scheduler]")
        );
    }

    #[test]
    fn data_returns_the_raw_payload() {
        let mut secret = string_data("ci", "zuul-db", None, BTreeMap::new());
        secret.data = Some(BTreeMap::from([(
            "dburi".to_string(),
            ByteString(b"mysql+pymysql://".to_vec()),
        )]));

        assert_eq!(data(&secret, "dburi"), Some(b"mysql+pymysql://".to_vec()));
        assert_eq!(data(&secret, "missing"), None);
    }
}
