//! # Index module
//!
//! This module provide the secret dependency index, a process-wide table
//! mapping instances to the external secrets their configuration is rendered
//! from, used to react to secret updates that carry no reference to the
//! owning instance

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use kube::{api::ListParams, Api, Client, ResourceExt};
use tracing::debug;

use crate::svc::crd::Zuul;

// -----------------------------------------------------------------------------
// Attribute enumeration

/// configuration attribute a secret is referenced from, it drives the
/// targeted action taken when the secret changes
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Attribute {
    TenantConfig,
    LauncherConfig,
}

// -----------------------------------------------------------------------------
// ConfigResource structure

/// a dependency edge from one instance attribute to an external secret
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ConfigResource {
    pub attribute: Attribute,
    pub namespace: String,
    pub zuul_name: String,
    pub secret_name: String,
}

// -----------------------------------------------------------------------------
// Table type

/// dependency edges keyed by the owning instance
pub type Table = HashMap<(String, String), Vec<ConfigResource>>;

// -----------------------------------------------------------------------------
// SecretIndex structure

/// holds the current dependency table, the table is only ever replaced as a
/// whole so readers observe either the previous or the fully rebuilt state
#[derive(Default)]
pub struct SecretIndex {
    table: RwLock<Arc<Table>>,
}

impl SecretIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// atomically swap the whole table for the given one
    pub fn replace(&self, table: Table) {
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        *guard = Arc::new(table);
    }

    /// returns the current table
    pub fn snapshot(&self) -> Arc<Table> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_owned()
    }

    /// returns whether a secret event could be relevant, an edge matches on
    /// namespace equality or secret name equality
    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        self.snapshot().values().any(|resources| {
            resources
                .iter()
                .any(|resource| resource.namespace == namespace || resource.secret_name == name)
        })
    }

    /// returns the edges strictly depending on the given secret
    pub fn affected(&self, namespace: &str, name: &str) -> Vec<ConfigResource> {
        self.snapshot()
            .values()
            .flatten()
            .filter(|resource| resource.namespace == namespace && resource.secret_name == name)
            .cloned()
            .collect()
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the dependency table computed from the given instances
pub fn collect(zuuls: &[Zuul]) -> Table {
    let mut table = Table::new();

    for zuul in zuuls {
        let namespace = match zuul.namespace() {
            Some(namespace) => namespace,
            None => continue,
        };

        let name = zuul.name_any();
        let resources = vec![
            ConfigResource {
                attribute: Attribute::TenantConfig,
                namespace: namespace.to_owned(),
                zuul_name: name.to_owned(),
                secret_name: zuul.spec.scheduler.config.secret_name.to_owned(),
            },
            ConfigResource {
                attribute: Attribute::LauncherConfig,
                namespace: namespace.to_owned(),
                zuul_name: name.to_owned(),
                secret_name: zuul.spec.launcher.config.secret_name.to_owned(),
            },
        ];

        table.insert((namespace, name), resources);
    }

    table
}

/// rebuild the index from every instance of the cluster, the table is fully
/// replaced so edges of deleted instances are dropped
pub async fn rebuild(client: &Client, index: &SecretIndex) -> Result<(), kube::Error> {
    let api: Api<Zuul> = Api::all(client.to_owned());
    let zuuls = api.list(&ListParams::default()).await?;

    let table = collect(&zuuls.items);

    debug!(instances = table.len(), "rebuild secret dependency index");
    index.replace(table);

    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::svc::crd::Zuul;

    use super::{collect, Attribute, SecretIndex};

    fn instance(namespace: &str, name: &str, tenant: &str, launcher: &str) -> Zuul {
        let spec = serde_json::from_value(json!({
            "scheduler": {"config": {"secretName": tenant}},
            "launcher": {"config": {"secretName": launcher}},
        }))
        .expect("specification to deserialize");

        let mut zuul = Zuul::new(name, spec);
        zuul.metadata.namespace = Some(namespace.to_string());
        zuul
    }

    #[test]
    fn collect_is_idempotent() {
        let zuuls = vec![
            instance("ci", "zuul", "zuul-tenant", "nodepool-config"),
            instance("qa", "gate", "gate-tenant", "gate-nodepool"),
        ];

        let first = collect(&zuuls);
        let second = collect(&zuuls);

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(
            first
                .get(&("ci".to_string(), "zuul".to_string()))
                .map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn matches_on_namespace_or_secret_name() {
        let index = SecretIndex::new();
        index.replace(collect(&[instance(
            "ci",
            "zuul",
            "zuul-tenant",
            "nodepool-config",
        )]));

        assert!(index.matches("ci", "unrelated"));
        assert!(index.matches("elsewhere", "zuul-tenant"));
        assert!(!index.matches("elsewhere", "unrelated"));
    }

    #[test]
    fn affected_requires_both_namespace_and_name() {
        let index = SecretIndex::new();
        index.replace(collect(&[instance(
            "ci",
            "zuul",
            "zuul-tenant",
            "nodepool-config",
        )]));

        let edges = index.affected("ci", "nodepool-config");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].attribute, Attribute::LauncherConfig);
        assert_eq!(edges[0].zuul_name, "zuul");

        assert!(index.affected("elsewhere", "nodepool-config").is_empty());
        assert!(index.affected("ci", "unrelated").is_empty());
    }

    #[test]
    fn replace_swaps_the_whole_table() {
        let index = SecretIndex::new();
        index.replace(collect(&[instance(
            "ci",
            "zuul",
            "zuul-tenant",
            "nodepool-config",
        )]));
        assert!(index.matches("ci", "zuul-tenant"));

        index.replace(collect(&[]));
        assert!(!index.matches("ci", "zuul-tenant"));
    }
}
