//! # Custom resource definition module
//!
//! This module provide the zuul custom resource, its definition and the
//! field-group table used to classify specification changes

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// -----------------------------------------------------------------------------
// Constants

/// annotation carrying the specification applied by the last successful
/// reconciliation, used to compute the field-group diff on update events
pub const LAST_APPLIED_ANNOTATION: &str = "operator.zuul-ci.org/last-applied-spec";

// -----------------------------------------------------------------------------
// SecretRef structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretRef {
    #[serde(rename = "secretName")]
    pub secret_name: String,
}

// -----------------------------------------------------------------------------
// SecretConfig structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretConfig {
    #[serde(rename = "config")]
    pub config: SecretRef,
}

// -----------------------------------------------------------------------------
// DatabaseSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct DatabaseSpec {
    /// connection secret of an externally managed database; when absent the
    /// operator provisions and manages its own database cluster
    #[serde(rename = "secretName", skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// relax anti-affinity and safety constraints of the managed cluster,
    /// for single-node test deployments only
    #[serde(rename = "allowUnsafe", skip_serializing_if = "Option::is_none")]
    pub allow_unsafe: Option<bool>,
}

// -----------------------------------------------------------------------------
// ZookeeperSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ZookeeperSpec {
    /// connection string of an externally managed zookeeper; when absent the
    /// operator provisions and manages its own cluster
    #[serde(rename = "hosts", skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
    #[serde(rename = "secretName", skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

// -----------------------------------------------------------------------------
// SchedulerSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SchedulerSpec {
    /// secret holding the tenant configuration under the `main.yaml` key
    #[serde(rename = "config")]
    pub config: SecretRef,
    #[serde(rename = "count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

// -----------------------------------------------------------------------------
// LauncherSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct LauncherSpec {
    /// secret holding the launcher configuration under the `nodepool.yaml` key
    #[serde(rename = "config")]
    pub config: SecretRef,
}

// -----------------------------------------------------------------------------
// EnvValue structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct EnvValue {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "value")]
    pub value: String,
}

// -----------------------------------------------------------------------------
// ComponentSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ComponentSpec {
    #[serde(rename = "count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(rename = "env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvValue>>,
}

// -----------------------------------------------------------------------------
// ExecutorSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ExecutorSpec {
    #[serde(rename = "count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(rename = "env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvValue>>,
    /// secret holding the private key used to log into job nodes, under the
    /// `sshkey` key
    #[serde(rename = "sshkey", skip_serializing_if = "Option::is_none")]
    pub sshkey: Option<SecretRef>,
    #[serde(
        rename = "terminationGracePeriodSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub termination_grace_period_seconds: Option<i64>,
}

// -----------------------------------------------------------------------------
// ConnectionSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ConnectionSpec {
    /// secret whose entries are merged into the connection section; the
    /// `sshkey` entry is replaced by its fixed in-container path
    #[serde(rename = "secretName", skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// RegistryTlsSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RegistryTlsSpec {
    /// certificate secret of an externally managed TLS key pair; when absent
    /// the operator issues one from its certificate authority
    #[serde(rename = "secretName", skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

// -----------------------------------------------------------------------------
// RegistrySpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RegistrySpec {
    #[serde(rename = "count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(rename = "config", skip_serializing_if = "Option::is_none")]
    pub config: Option<SecretRef>,
    #[serde(rename = "tls", skip_serializing_if = "Option::is_none")]
    pub tls: Option<RegistryTlsSpec>,
}

// -----------------------------------------------------------------------------
// JobVolume structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct JobVolume {
    #[serde(rename = "context")]
    pub context: String,
    #[serde(rename = "access", skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(rename = "path")]
    pub path: String,
}

// -----------------------------------------------------------------------------
// ZuulSpec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "operator.zuul-ci.org")]
#[kube(version = "v1alpha2")]
#[kube(kind = "Zuul")]
#[kube(singular = "zuul")]
#[kube(plural = "zuuls")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct ZuulSpec {
    #[serde(rename = "imagePrefix", skip_serializing_if = "Option::is_none")]
    pub image_prefix: Option<String>,
    #[serde(rename = "imagePullSecrets", skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<SecretRef>>,
    #[serde(rename = "zuulImageVersion", skip_serializing_if = "Option::is_none")]
    pub zuul_image_version: Option<String>,
    #[serde(
        rename = "zuulPreviewImageVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub zuul_preview_image_version: Option<String>,
    #[serde(
        rename = "zuulRegistryImageVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub zuul_registry_image_version: Option<String>,
    #[serde(
        rename = "nodepoolImageVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub nodepool_image_version: Option<String>,
    #[serde(rename = "database", skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseSpec>,
    #[serde(rename = "zookeeper", skip_serializing_if = "Option::is_none")]
    pub zookeeper: Option<ZookeeperSpec>,
    #[serde(rename = "scheduler")]
    pub scheduler: SchedulerSpec,
    #[serde(rename = "launcher")]
    pub launcher: LauncherSpec,
    #[serde(rename = "connections", default)]
    pub connections: BTreeMap<String, ConnectionSpec>,
    #[serde(rename = "executor", skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorSpec>,
    #[serde(rename = "merger", skip_serializing_if = "Option::is_none")]
    pub merger: Option<ComponentSpec>,
    #[serde(rename = "web", skip_serializing_if = "Option::is_none")]
    pub web: Option<ComponentSpec>,
    #[serde(rename = "fingergw", skip_serializing_if = "Option::is_none")]
    pub fingergw: Option<ComponentSpec>,
    #[serde(rename = "registry", skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySpec>,
    #[serde(rename = "jobVolumes", skip_serializing_if = "Option::is_none")]
    pub job_volumes: Option<Vec<JobVolume>>,
    #[serde(rename = "externalConfig", skip_serializing_if = "Option::is_none")]
    pub external_config: Option<BTreeMap<String, SecretRef>>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    /// checksum of the configuration rendered by the last reconciliation
    #[serde(rename = "configChecksum", skip_serializing_if = "Option::is_none")]
    pub config_checksum: Option<String>,
}

impl Zuul {
    pub fn set_config_checksum(&mut self, checksum: Option<String>) {
        let status = self.status.get_or_insert_with(Status::default);

        status.config_checksum = checksum;
    }
}

// -----------------------------------------------------------------------------
// FieldGroup structure

/// one entry of the enumerated change-classification table: a top-level
/// specification field and the scopes a difference in it affects
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct FieldGroup {
    pub name: &'static str,
    pub affects_configuration: bool,
    pub affects_structure: bool,
}

const fn group(name: &'static str, configuration: bool, structure: bool) -> FieldGroup {
    FieldGroup {
        name,
        affects_configuration: configuration,
        affects_structure: structure,
    }
}

/// classification table for update events, a difference in a field marked
/// `affects_configuration` requires re-rendering the configuration, a
/// difference in a field marked `affects_structure` requires re-applying the
/// workload set; a configuration change always implies a structure change
pub const FIELD_GROUPS: &[FieldGroup] = &[
    group("database", true, false),
    group("zookeeper", true, false),
    group("connections", true, true),
    group("executor", true, false),
    group("merger", true, false),
    group("scheduler", true, false),
    group("web", true, false),
    group("fingergw", true, false),
    group("registry", false, true),
    group("launcher", false, true),
    group("externalConfig", false, true),
    group("imagePrefix", false, true),
    group("imagePullSecrets", false, true),
    group("zuulImageVersion", false, true),
    group("zuulPreviewImageVersion", false, true),
    group("zuulRegistryImageVersion", false, true),
    group("nodepoolImageVersion", false, true),
];

// -----------------------------------------------------------------------------
// ChangeSet structure

#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct ChangeSet {
    /// the rendered configuration is stale and must be re-rendered
    pub conf_changed: bool,
    /// the workload set is stale and must be re-applied
    pub spec_changed: bool,
    /// the database field group itself changed, its dependency steps rerun
    pub database: bool,
    /// the zookeeper field group itself changed, its dependency steps rerun
    pub zookeeper: bool,
}

impl ChangeSet {
    pub fn any(&self) -> bool {
        self.conf_changed || self.spec_changed
    }
}

// -----------------------------------------------------------------------------
// classification helpers

/// classify the difference between two specifications against the
/// field-group table
pub fn classify(old: &ZuulSpec, new: &ZuulSpec) -> Result<ChangeSet, serde_json::Error> {
    Ok(classify_values(
        &serde_json::to_value(old)?,
        &serde_json::to_value(new)?,
    ))
}

fn classify_values(old: &Value, new: &Value) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for field in FIELD_GROUPS {
        if old.get(field.name) == new.get(field.name) {
            continue;
        }

        tracing::info!(field = field.name, "Specification field changed");
        changes.conf_changed |= field.affects_configuration;
        changes.spec_changed |= field.affects_structure;
        match field.name {
            "database" => changes.database = true,
            "zookeeper" => changes.zookeeper = true,
            _ => {}
        }
    }

    // A configuration change always forces a redeploy of the workload set as
    // the new configuration secret must be mounted into the pods.
    changes.spec_changed |= changes.conf_changed;
    changes
}

// -----------------------------------------------------------------------------
// last-applied annotation helpers

/// returns the specification recorded by the last successful reconciliation,
/// if any
pub fn last_applied(zuul: &Zuul) -> Result<Option<ZuulSpec>, serde_json::Error> {
    zuul.annotations()
        .get(LAST_APPLIED_ANNOTATION)
        .map(|raw| serde_json::from_str(raw))
        .transpose()
}

/// record the given specification on the resource so that the next update
/// event can be diffed against it
pub fn record_applied(zuul: &mut Zuul) -> Result<(), serde_json::Error> {
    let raw = serde_json::to_string(&zuul.spec)?;

    zuul.annotations_mut()
        .insert(LAST_APPLIED_ANNOTATION.to_string(), raw);
    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn spec() -> ZuulSpec {
        serde_json::from_value(json!({
            "scheduler": {"config": {"secretName": "zuul-tenant-config"}},
            "launcher": {"config": {"secretName": "nodepool-config"}},
            "connections": {
                "gerrit": {"secretName": "gerrit-secrets", "driver": "gerrit"}
            },
            "registry": {"count": 1, "config": {"secretName": "registry-conf"}}
        }))
        .expect("specification to deserialize")
    }

    fn mutated(name: &str) -> ZuulSpec {
        let mut value = serde_json::to_value(spec()).expect("specification to serialize");

        // Overwrite the field group with a marker value that differs from
        // whatever the base specification holds.
        value[name] = match name {
            "connections" => json!({"gerrit": {"driver": "gerrit", "server": "review"}}),
            "scheduler" => json!({"config": {"secretName": "other"}}),
            "launcher" => json!({"config": {"secretName": "other"}}),
            "database" => json!({"secretName": "external-db"}),
            "zookeeper" => json!({"hosts": "zk.example.org:2281"}),
            "executor" | "merger" | "web" | "fingergw" | "registry" => json!({"count": 9}),
            "imagePullSecrets" => json!([{"secretName": "pull-secret"}]),
            "externalConfig" => json!({"cloud": {"secretName": "clouds-yaml"}}),
            _ => Value::String("changed".to_string()),
        };

        serde_json::from_value(value).expect("mutated specification to deserialize")
    }

    #[test]
    fn unchanged_specification_yields_no_change() {
        let changes = classify(&spec(), &spec()).expect("classification to succeed");

        assert_eq!(changes, ChangeSet::default());
        assert!(!changes.any());
    }

    #[test]
    fn every_field_group_is_classified() {
        for field in FIELD_GROUPS {
            let changes =
                classify(&spec(), &mutated(field.name)).expect("classification to succeed");

            assert_eq!(
                changes.conf_changed, field.affects_configuration,
                "conf_changed mismatch for field group '{}'",
                field.name
            );
            // A configuration change always implies a structure change.
            assert_eq!(
                changes.spec_changed,
                field.affects_structure || field.affects_configuration,
                "spec_changed mismatch for field group '{}'",
                field.name
            );
            assert!(changes.any());
        }
    }

    #[test]
    fn registry_count_change_redeploys_without_reconfiguration() {
        let mut new = spec();
        if let Some(registry) = new.registry.as_mut() {
            registry.count = Some(3);
        }

        let changes = classify(&spec(), &new).expect("classification to succeed");

        assert!(!changes.conf_changed);
        assert!(changes.spec_changed);
    }

    #[test]
    fn database_change_marks_dependency_rerun() {
        let mut new = spec();
        new.database = Some(DatabaseSpec {
            secret_name: Some("external-db".to_string()),
            allow_unsafe: None,
        });

        let changes = classify(&spec(), &new).expect("classification to succeed");

        assert!(changes.database);
        assert!(!changes.zookeeper);
        assert!(changes.conf_changed);
        assert!(changes.spec_changed);
    }

    #[test]
    fn last_applied_round_trips_through_annotation() {
        let mut zuul = Zuul::new("zuul", spec());

        assert!(last_applied(&zuul)
            .expect("absent annotation to parse as none")
            .is_none());

        record_applied(&mut zuul).expect("annotation to be recorded");
        let recorded = last_applied(&zuul)
            .expect("annotation to parse")
            .expect("annotation to be present");

        assert_eq!(recorded, zuul.spec);
    }
}
