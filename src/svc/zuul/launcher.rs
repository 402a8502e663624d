//! # Launcher module
//!
//! This module shard the nodepool configuration document into one secret per
//! provider and compute the garbage collection diff against the live set of
//! launcher deployments

use std::collections::BTreeSet;

use serde_yaml::{Mapping, Value};

use crate::svc::zuul::conf;

// -----------------------------------------------------------------------------
// constants

pub const NODEPOOL_CONFIG_KEY: &str = "nodepool.yaml";
pub const PROVIDER_LABEL: &str = "operator.zuul-ci.org/nodepool-provider";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse nodepool configuration, {0}")]
    Parse(serde_yaml::Error),
    #[error("failed to serialize provider shard, {0}")]
    Serialize(serde_yaml::Error),
    #[error("nodepool configuration does not hold a 'providers' list")]
    MissingProviders,
    #[error("provider entry does not hold a 'name' key")]
    MissingProviderName,
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the deterministic name of the configuration secret of a provider
pub fn shard_secret_name(instance: &str, provider: &str) -> String {
    format!("nodepool-config-{instance}-{provider}")
}

/// returns the deterministic name of the launcher deployment of a provider
pub fn launcher_deployment_name(instance: &str, provider: &str) -> String {
    format!("nodepool-launcher-{instance}-{provider}")
}

/// parse a zookeeper connection string into per server entries, an optional
/// chroot suffix applies to every server
pub fn parse_zk_hosts(hosts: &str) -> Vec<Value> {
    let (hosts, chroot) = match hosts.split_once('/') {
        Some((hosts, chroot)) => (hosts, Some(chroot)),
        None => (hosts, None),
    };

    hosts
        .split(',')
        .map(|entry| {
            let (host, port) = match entry.rsplit_once(':') {
                Some((host, port)) => (host, port),
                None => (entry, "2281"),
            };

            let mut server = Mapping::new();
            server.insert("host".into(), host.into());
            server.insert("port".into(), port.into());
            if let Some(chroot) = chroot {
                server.insert("chroot".into(), chroot.into());
            }

            Value::Mapping(server)
        })
        .collect()
}

/// split the nodepool configuration into one document per provider, each
/// shard carries the whole document with its providers list restricted to
/// one entry and the zookeeper connection injected
pub fn shard(document: &str, zk_hosts: &str) -> Result<Vec<(String, String)>, Error> {
    let mut base: Mapping = serde_yaml::from_str(document).map_err(Error::Parse)?;

    base.insert(
        "zookeeper-servers".into(),
        Value::Sequence(parse_zk_hosts(zk_hosts)),
    );

    let mut tls = Mapping::new();
    tls.insert("cert".into(), conf::ZOOKEEPER_TLS_CERT.into());
    tls.insert("key".into(), conf::ZOOKEEPER_TLS_KEY.into());
    tls.insert("ca".into(), conf::ZOOKEEPER_TLS_CA.into());
    base.insert("zookeeper-tls".into(), Value::Mapping(tls));

    let providers = match base.get("providers") {
        Some(Value::Sequence(providers)) => providers.to_owned(),
        _ => return Err(Error::MissingProviders),
    };

    let mut shards = Vec::with_capacity(providers.len());

    for provider in &providers {
        let name = provider
            .get("name")
            .and_then(Value::as_str)
            .ok_or(Error::MissingProviderName)?
            .to_string();

        let mut shard = base.to_owned();
        shard.insert(
            "providers".into(),
            Value::Sequence(vec![provider.to_owned()]),
        );

        let text = serde_yaml::to_string(&shard).map_err(Error::Serialize)?;
        shards.push((name, text));
    }

    Ok(shards)
}

/// returns the provider names present in the old set but absent from the new
/// one, those workloads and secrets are garbage collected
pub fn orphans(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Vec<String> {
    old.difference(new).cloned().collect()
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_yaml::{Mapping, Value};

    use super::{
        launcher_deployment_name, orphans, parse_zk_hosts, shard, shard_secret_name,
    };

    const NODEPOOL_YAML: &str = r#"
labels:
  - name: pod-fedora
providers:
  - name: openstack
    driver: openstack
    cloud: mycloud
  - name: kubes
    driver: kubernetes
    context: local
"#;

    #[test]
    fn names_are_deterministic() {
        assert_eq!(
            shard_secret_name("zuul", "openstack"),
            "nodepool-config-zuul-openstack"
        );
        assert_eq!(
            launcher_deployment_name("zuul", "openstack"),
            "nodepool-launcher-zuul-openstack"
        );
    }

    #[test]
    fn zk_hosts_parse_with_chroot() {
        let servers = parse_zk_hosts("zk1:2281,zk2:2281/nodepool");

        assert_eq!(servers.len(), 2);
        assert_eq!(
            servers[0].get("host").and_then(Value::as_str),
            Some("zk1")
        );
        assert_eq!(
            servers[0].get("port").and_then(Value::as_str),
            Some("2281")
        );
        assert_eq!(
            servers[1].get("chroot").and_then(Value::as_str),
            Some("nodepool")
        );
    }

    #[test]
    fn shards_restrict_the_providers_list() {
        let shards = shard(NODEPOOL_YAML, "zookeeper.ci:2281").expect("document to shard");

        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].0, "openstack");
        assert_eq!(shards[1].0, "kubes");

        let first: Mapping =
            serde_yaml::from_str(&shards[0].1).expect("shard to parse");
        let providers = first
            .get("providers")
            .and_then(Value::as_sequence)
            .expect("providers to be a list");

        assert_eq!(providers.len(), 1);
        assert_eq!(
            providers[0].get("name").and_then(Value::as_str),
            Some("openstack")
        );
        assert!(first.get("zookeeper-servers").is_some());
        assert!(first.get("zookeeper-tls").is_some());
        assert!(first.get("labels").is_some());
    }

    #[test]
    fn orphans_are_the_removed_providers() {
        let old = BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()]);
        let new = BTreeSet::from(["b".to_string(), "c".to_string(), "d".to_string()]);

        assert_eq!(orphans(&old, &new), vec!["a".to_string()]);
    }
}
