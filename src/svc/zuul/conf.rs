//! # Configuration renderer module
//!
//! This module render the zuul.conf text from the normalized specification
//! and compute the content checksum attached to workloads

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::svc::crd::JobVolume;

// -----------------------------------------------------------------------------
// constants

pub const CONFIG_SECRET: &str = "zuul-config";
pub const CONFIG_SECRET_KEY: &str = "zuul.conf";
pub const TENANT_CONFIG_PATH: &str = "/etc/zuul/tenant/main.yaml";
pub const ZOOKEEPER_TLS_CA: &str = "/tls/client/ca.crt";
pub const ZOOKEEPER_TLS_CERT: &str = "/tls/client/tls.crt";
pub const ZOOKEEPER_TLS_KEY: &str = "/tls/client/tls.key";
pub const EXECUTOR_PRIVATE_KEY_PATH: &str = "/etc/zuul/sshkey/sshkey";

// -----------------------------------------------------------------------------
// Context structure

/// everything the renderer needs, resolved beforehand so that rendering
/// itself is a pure function
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Context {
    pub zookeeper_hosts: String,
    pub dburi: String,
    /// per context and access mode job volume paths, already joined
    pub executor_paths: BTreeMap<String, String>,
    /// connection sections with secret material already merged in
    pub connections: BTreeMap<String, BTreeMap<String, String>>,
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the in-container path a connection ssh key is mounted at instead
/// of inlining its bytes
pub fn connection_sshkey_path(connection: &str) -> String {
    format!("/etc/zuul/connections/{connection}/sshkey")
}

/// returns the per context and access mode path entries of the executor
/// section, paths of the same entry are joined with ':'
pub fn executor_volume_paths(volumes: &[JobVolume]) -> BTreeMap<String, String> {
    let mut paths: BTreeMap<String, String> = BTreeMap::new();

    for volume in volumes {
        let access = volume.access.as_deref().unwrap_or("ro");
        let key = format!("{}_{}_paths", volume.context, access);

        paths
            .entry(key)
            .and_modify(|entry| {
                entry.push(':');
                entry.push_str(&volume.path);
            })
            .or_insert_with(|| volume.path.to_owned());
    }

    paths
}

/// render the zuul.conf text, sections and keys are emitted in a stable
/// order so that an unchanged context yields an unchanged checksum
pub fn render(ctx: &Context) -> String {
    let mut text = String::new();

    text.push_str("[zookeeper]\n");
    text.push_str(&format!("hosts={}\n", ctx.zookeeper_hosts));
    text.push_str(&format!("tls_ca={ZOOKEEPER_TLS_CA}\n"));
    text.push_str(&format!("tls_cert={ZOOKEEPER_TLS_CERT}\n"));
    text.push_str(&format!("tls_key={ZOOKEEPER_TLS_KEY}\n"));

    text.push_str("\n[database]\n");
    text.push_str(&format!("dburi={}\n", ctx.dburi));

    text.push_str("\n[scheduler]\n");
    text.push_str(&format!("tenant_config={TENANT_CONFIG_PATH}\n"));

    text.push_str("\n[executor]\n");
    text.push_str(&format!("private_key_file={EXECUTOR_PRIVATE_KEY_PATH}\n"));
    for (key, value) in &ctx.executor_paths {
        text.push_str(&format!("{key}={value}\n"));
    }

    text.push_str("\n[web]\n");
    text.push_str("listen_address=0.0.0.0\n");
    text.push_str("port=9000\n");

    text.push_str("\n[fingergw]\n");
    text.push_str("port=9079\n");

    for (name, options) in &ctx.connections {
        text.push_str(&format!("\n[connection {name}]\n"));
        for (key, value) in options {
            text.push_str(&format!("{key}={value}\n"));
        }
    }

    text
}

/// returns the sha256 checksum of the given bytes as lowercase hexadecimal
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::svc::crd::JobVolume;

    use super::{checksum, connection_sshkey_path, executor_volume_paths, render, Context};

    fn context() -> Context {
        Context {
            zookeeper_hosts: "zookeeper.ci:2281".to_string(),
            dburi: "mysql+pymysql://zuul:pw@db-cluster-haproxy/zuul".to_string(),
            executor_paths: BTreeMap::new(),
            connections: BTreeMap::from([(
                "gerrit".to_string(),
                BTreeMap::from([
                    ("driver".to_string(), "gerrit".to_string()),
                    ("sshkey".to_string(), connection_sshkey_path("gerrit")),
                ]),
            )]),
        }
    }

    #[test]
    fn render_emits_every_section() {
        let text = render(&context());

        assert!(text.contains("[zookeeper]\nhosts=zookeeper.ci:2281\n"));
        assert!(text.contains("dburi=mysql+pymysql://zuul:pw@db-cluster-haproxy/zuul"));
        assert!(text.contains("tenant_config=/etc/zuul/tenant/main.yaml"));
        assert!(text.contains("[connection gerrit]"));
        assert!(text.contains("sshkey=/etc/zuul/connections/gerrit/sshkey"));
    }

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let text = render(&context());
        assert_eq!(checksum(text.as_bytes()), checksum(text.as_bytes()));

        let mut other = context();
        other.dburi.push('x');
        assert_ne!(
            checksum(text.as_bytes()),
            checksum(render(&other).as_bytes())
        );
    }

    #[test]
    fn job_volume_paths_concatenate_per_access_mode() {
        let volumes = vec![
            JobVolume {
                context: "trusted".to_string(),
                access: Some("ro".to_string()),
                path: "/opt/secrets".to_string(),
            },
            JobVolume {
                context: "trusted".to_string(),
                access: Some("ro".to_string()),
                path: "/opt/keys".to_string(),
            },
            JobVolume {
                context: "untrusted".to_string(),
                access: Some("rw".to_string()),
                path: "/var/cache".to_string(),
            },
        ];

        let paths = executor_volume_paths(&volumes);

        assert_eq!(
            paths.get("trusted_ro_paths").map(String::as_str),
            Some("/opt/secrets:/opt/keys")
        );
        assert_eq!(
            paths.get("untrusted_rw_paths").map(String::as_str),
            Some("/var/cache")
        );
    }
}
