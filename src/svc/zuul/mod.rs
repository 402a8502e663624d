//! # Zuul module
//!
//! This module provide the reconciliation engine of the zuul custom
//! resource, it sequences the dependency installers, renders the
//! configuration, applies the workload set and reacts to configuration
//! secret updates

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{EnvVar, Pod, Secret},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::ListParams,
    core::DynamicObject,
    runtime::{
        controller::{self, Action as ReconcileAction},
        watcher, Controller,
    },
    Api, ResourceExt,
};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::svc::{
    crd::{self, EnvValue, Zuul, ZuulSpec},
    dependency::{self, certmanager, pxc, zookeeper},
    k8s::{
        self, apply, exec, poll, recorder, resource, secret, ControllerBuilder, State,
    },
};

pub mod conf;
pub mod index;
pub mod launcher;
pub mod objects;

// -----------------------------------------------------------------------------
// constants

pub const TENANT_CONFIG_KEY: &str = "main.yaml";
pub const REGISTRY_CONFIG_KEY: &str = "registry.yaml";
pub const RESERVED_KUBECONFIG: &str = "/etc/zuul/kube/config";

const PASSWORD_LENGTH: usize = 32;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to watch secrets, {0}")]
    Watch(watcher::Error),
    #[error("secret '{0}' does not exist")]
    SecretMissing(String),
    #[error("secret '{0}' does not contain key '{1}'")]
    SecretKeyMissing(String, String),
    #[error("failed to decode secret payload, {0}")]
    Decode(std::string::FromUtf8Error),
    #[error("specification is structurally incomplete, {0}")]
    MissingConfiguration(String),
    #[error("failed to serialize specification, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("failed to process yaml document, {0}")]
    Yaml(serde_yaml::Error),
    #[error("failed to process launcher configuration, {0}")]
    Launcher(launcher::Error),
    #[error("failed to apply object, {0}")]
    Apply(apply::Error),
    #[error("failed to execute command in pod, {0}")]
    Exec(exec::Error),
    #[error("failed to wait for workload, {0}")]
    Wait(poll::Error),
    #[error("failed to handle certificate authority, {0}")]
    CertManager(certmanager::Error),
    #[error("failed to handle database cluster, {0}")]
    Database(pxc::Error),
    #[error("failed to handle zookeeper ensemble, {0}")]
    Zookeeper(zookeeper::Error),
}

impl Error {
    /// returns whether retrying without operator intervention is pointless
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::MissingConfiguration(_)
                | Self::Serialize(_)
                | Self::Diff(_)
                | Self::Decode(_)
                | Self::Yaml(_)
                | Self::Launcher(_)
        )
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for Error {
    fn from(err: controller::Error<Error, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// Action enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    Create,
    Update,
    SmartReconfigure,
    UpsertNodepool,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Update => write!(f, "Update"),
            Self::SmartReconfigure => write!(f, "SmartReconfigure"),
            Self::UpsertNodepool => write!(f, "UpsertNodepool"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns a random alphanumeric password
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

// -----------------------------------------------------------------------------
// Instance structure

/// the normalized, fully defaulted description of one zuul deployment, the
/// management ownership of each dependency is resolved once here
#[derive(PartialEq, Clone, Debug)]
pub struct Instance {
    pub name: String,
    pub namespace: String,
    pub spec: ZuulSpec,
    pub manage_db: bool,
    pub db_secret: String,
    pub allow_unsafe_db: bool,
    pub manage_zk: bool,
    pub zk_hosts: String,
    pub zk_secret: String,
    pub tenant_secret: String,
    pub nodepool_secret: String,
}

impl Instance {
    /// normalize the raw specification, a dependency with no secret or host
    /// reference is self-managed under well-known names
    pub fn normalize(name: &str, namespace: &str, spec: ZuulSpec) -> Self {
        let database = spec.database.to_owned().unwrap_or_default();
        let (manage_db, db_secret) = match database.secret_name {
            Some(secret) => (false, secret),
            None => (true, pxc::DATABASE_SECRET.to_string()),
        };

        let zk = spec.zookeeper.to_owned().unwrap_or_default();
        let (manage_zk, zk_hosts) = match zk.hosts {
            Some(hosts) => (false, hosts),
            None => (true, zookeeper::default_hosts(namespace)),
        };

        let zk_secret = zk
            .secret_name
            .unwrap_or_else(|| zookeeper::CLIENT_TLS_SECRET.to_string());

        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            manage_db,
            db_secret,
            allow_unsafe_db: database.allow_unsafe.unwrap_or(false),
            manage_zk,
            zk_hosts,
            zk_secret,
            tenant_secret: spec.scheduler.config.secret_name.to_owned(),
            nodepool_secret: spec.launcher.config.secret_name.to_owned(),
            spec,
        }
    }

    pub fn zuul_image(&self, component: &str) -> String {
        let prefix = self.spec.image_prefix.as_deref().unwrap_or("zuul");
        let version = self.spec.zuul_image_version.as_deref().unwrap_or("4.1.0");

        format!("{prefix}/{component}:{version}")
    }

    pub fn nodepool_image(&self, component: &str) -> String {
        let prefix = self.spec.image_prefix.as_deref().unwrap_or("zuul");
        let version = self
            .spec
            .nodepool_image_version
            .as_deref()
            .unwrap_or("4.1.0");

        format!("{prefix}/{component}:{version}")
    }

    pub fn registry_image(&self) -> String {
        let prefix = self.spec.image_prefix.as_deref().unwrap_or("zuul");
        let version = self
            .spec
            .zuul_registry_image_version
            .as_deref()
            .unwrap_or("latest");

        format!("{prefix}/zuul-registry:{version}")
    }

    /// returns the container environment, reserved variables are force-set
    /// and user supplied entries with the same name are discarded
    pub fn normalized_env(&self, env: &[EnvValue]) -> Vec<EnvVar> {
        let mut variables: Vec<EnvVar> = env
            .iter()
            .filter(|variable| variable.name != "KUBECONFIG")
            .map(|variable| EnvVar {
                name: variable.name.to_owned(),
                value: Some(variable.value.to_owned()),
                ..Default::default()
            })
            .collect();

        variables.push(EnvVar {
            name: "KUBECONFIG".to_string(),
            value: Some(RESERVED_KUBECONFIG.to_string()),
            ..Default::default()
        });

        variables
    }
}

// -----------------------------------------------------------------------------
// Engine structure

/// drives one instance toward its desired state, one engine is built per
/// reconciliation event
pub struct Engine {
    state: Arc<State>,
    pub instance: Instance,
    owner: OwnerReference,
    installing_cert_manager: bool,
}

impl Engine {
    pub fn new(state: Arc<State>, zuul: &Zuul) -> Self {
        let (namespace, name) = resource::namespaced_name(zuul);

        Self {
            owner: resource::owner_reference(zuul),
            instance: Instance::normalize(&name, &namespace, zuul.spec.to_owned()),
            state,
            installing_cert_manager: false,
        }
    }

    fn poller(&self) -> poll::Poller {
        poll::Poller::new(
            std::time::Duration::from_secs(self.state.config.operator.poll_interval),
            None,
        )
    }

    /// the creation sequence, the database install is issued first because
    /// it is slow and independent, then only awaited once the certificate
    /// authority and zookeeper chain completed
    pub async fn create(&mut self) -> Result<String, Error> {
        self.install_db().await?;
        self.install_cert_manager().await?;
        self.wait_for_cert_manager().await?;
        self.create_cert_manager_ca().await?;
        self.install_zk().await?;
        self.wait_for_zk().await?;
        self.wait_for_db().await?;

        let checksum = self.write_zuul_conf().await?;

        self.create_zuul(&checksum).await?;
        Ok(checksum)
    }

    /// the update sequence, driven by the field-group classification of the
    /// difference with the previously applied specification
    pub async fn update(&mut self, changes: &crd::ChangeSet) -> Result<String, Error> {
        if changes.database {
            self.install_db().await?;
            self.wait_for_db().await?;
        }

        if changes.zookeeper {
            self.install_cert_manager().await?;
            self.wait_for_cert_manager().await?;
            self.create_cert_manager_ca().await?;
            self.install_zk().await?;
            self.wait_for_zk().await?;
        }

        let checksum = if changes.conf_changed {
            self.write_zuul_conf().await?
        } else {
            self.current_checksum().await?
        };

        if changes.spec_changed {
            self.create_zuul(&checksum).await?;
        }

        if changes.conf_changed {
            // the new configuration secret must be mounted into the new
            // generation of pods before they are told to reload it
            if changes.spec_changed {
                self.wait_for_scheduler_rollout().await?;
            }

            self.smart_reconfigure().await?;
        }

        Ok(checksum)
    }

    pub async fn install_db(&mut self) -> Result<(), Error> {
        if !self.instance.manage_db {
            info!(
                namespace = self.instance.namespace,
                name = self.instance.name,
                "database is externally managed"
            );
            return Ok(());
        }

        if !dependency::crd_installed(&self.state.kube, pxc::CRD_NAME).await? {
            pxc::install(&self.state.kube, &self.instance.namespace)
                .await
                .map_err(Error::Database)?;
        }

        pxc::create_cluster(
            &self.state.kube,
            &self.instance.namespace,
            self.instance.allow_unsafe_db,
            &self.owner,
        )
        .await
        .map_err(Error::Database)
    }

    pub async fn wait_for_db(&mut self) -> Result<(), Error> {
        if !self.instance.manage_db {
            return Ok(());
        }

        info!(
            namespace = self.instance.namespace,
            name = self.instance.name,
            "wait for database cluster"
        );
        pxc::wait_for_cluster(&self.state.kube, &self.instance.namespace, &self.poller())
            .await
            .map_err(Error::Database)?;

        // the database and its user are provisioned exactly once, gated on
        // the connection uri secret being absent
        if self.dburi().await?.is_none() {
            let password = generate_password(PASSWORD_LENGTH);

            pxc::create_database(
                &self.state.kube,
                &self.instance.namespace,
                &password,
                &self.owner,
            )
            .await
            .map_err(Error::Database)?;
        }

        Ok(())
    }

    async fn dburi(&self) -> Result<Option<String>, Error> {
        let obj = secret::find(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            &self.instance.db_secret,
        )
        .await?;

        match obj {
            None => Ok(None),
            Some(obj) => {
                let payload = secret::data(&obj, pxc::DATABASE_SECRET_KEY).ok_or_else(|| {
                    Error::SecretKeyMissing(
                        self.instance.db_secret.to_owned(),
                        pxc::DATABASE_SECRET_KEY.to_string(),
                    )
                })?;

                Ok(Some(String::from_utf8(payload).map_err(Error::Decode)?))
            }
        }
    }

    pub async fn install_cert_manager(&mut self) -> Result<(), Error> {
        if dependency::crd_installed(&self.state.kube, certmanager::CRD_NAME).await? {
            return Ok(());
        }

        self.installing_cert_manager = true;
        certmanager::install(&self.state.kube)
            .await
            .map_err(Error::CertManager)
    }

    pub async fn wait_for_cert_manager(&mut self) -> Result<(), Error> {
        if !self.installing_cert_manager {
            return Ok(());
        }

        info!("wait for cert-manager webhook");
        certmanager::wait(&self.state.kube, &self.poller())
            .await
            .map_err(Error::CertManager)
    }

    pub async fn create_cert_manager_ca(&mut self) -> Result<(), Error> {
        certmanager::create_ca(&self.state.kube, &self.instance.namespace, &self.owner)
            .await
            .map_err(Error::CertManager)
    }

    pub async fn install_zk(&mut self) -> Result<(), Error> {
        if !self.instance.manage_zk {
            info!(
                namespace = self.instance.namespace,
                name = self.instance.name,
                "zookeeper is externally managed"
            );
            return Ok(());
        }

        zookeeper::create(&self.state.kube, &self.instance.namespace, &self.owner)
            .await
            .map_err(Error::Zookeeper)
    }

    pub async fn wait_for_zk(&mut self) -> Result<(), Error> {
        if !self.instance.manage_zk {
            return Ok(());
        }

        info!(
            namespace = self.instance.namespace,
            name = self.instance.name,
            "wait for zookeeper ensemble"
        );
        zookeeper::wait_for_cluster(&self.state.kube, &self.instance.namespace, &self.poller())
            .await
            .map_err(Error::Zookeeper)
    }

    /// render the zuul.conf text from the resolved context and persist it in
    /// the configuration secret, returns the content checksum
    pub async fn write_zuul_conf(&mut self) -> Result<String, Error> {
        let dburi = self
            .dburi()
            .await?
            .ok_or_else(|| Error::SecretMissing(self.instance.db_secret.to_owned()))?;

        let mut connections = BTreeMap::new();

        for (name, connection) in &self.instance.spec.connections {
            let mut options = connection.options.to_owned();

            if let Some(secret_name) = &connection.secret_name {
                let obj = secret::find(
                    self.state.kube.to_owned(),
                    &self.instance.namespace,
                    secret_name,
                )
                .await?
                .ok_or_else(|| Error::SecretMissing(secret_name.to_owned()))?;

                for (key, payload) in obj.data.unwrap_or_default() {
                    // the ssh key is mounted as a file, every other entry is
                    // inlined
                    let value = if key == "sshkey" {
                        conf::connection_sshkey_path(name)
                    } else {
                        String::from_utf8(payload.0).map_err(Error::Decode)?
                    };

                    options.insert(key, value);
                }
            }

            connections.insert(name.to_owned(), options);
        }

        let context = conf::Context {
            zookeeper_hosts: self.instance.zk_hosts.to_owned(),
            dburi,
            executor_paths: conf::executor_volume_paths(
                self.instance.spec.job_volumes.as_deref().unwrap_or_default(),
            ),
            connections,
        };

        let text = conf::render(&context);
        let checksum = conf::checksum(text.as_bytes());

        secret::upsert(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            conf::CONFIG_SECRET,
            Some(&self.owner),
            BTreeMap::from([(conf::CONFIG_SECRET_KEY.to_string(), text)]),
        )
        .await?;

        Ok(checksum)
    }

    /// returns the checksum of the configuration already persisted, falling
    /// back to a fresh render when the secret does not exist yet
    pub async fn current_checksum(&mut self) -> Result<String, Error> {
        let obj = secret::find(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            conf::CONFIG_SECRET,
        )
        .await?;

        match obj.and_then(|obj| secret::data(&obj, conf::CONFIG_SECRET_KEY)) {
            Some(payload) => Ok(conf::checksum(&payload)),
            None => self.write_zuul_conf().await,
        }
    }

    /// apply the whole workload set of the instance
    pub async fn create_zuul(&mut self, checksum: &str) -> Result<(), Error> {
        let kube = self.state.kube.to_owned();

        resource::upsert(
            kube.to_owned(),
            &objects::scheduler_statefulset(&self.instance, checksum, &self.owner),
        )
        .await?;

        resource::upsert(
            kube.to_owned(),
            &objects::executor_statefulset(&self.instance, checksum, &self.owner),
        )
        .await?;

        let web = self.instance.spec.web.to_owned().unwrap_or_default();
        resource::upsert(
            kube.to_owned(),
            &objects::component_deployment(
                &self.instance,
                objects::WEB_COMPONENT,
                "zuul-web",
                web.count.unwrap_or(3),
                web.env.as_deref().unwrap_or_default(),
                checksum,
                &self.owner,
            ),
        )
        .await?;
        resource::upsert(
            kube.to_owned(),
            &objects::component_service(&self.instance, objects::WEB_COMPONENT, 9000, &self.owner),
        )
        .await?;

        if let Some(merger) = self.instance.spec.merger.to_owned() {
            resource::upsert(
                kube.to_owned(),
                &objects::component_deployment(
                    &self.instance,
                    objects::MERGER_COMPONENT,
                    "zuul-merger",
                    merger.count.unwrap_or(1),
                    merger.env.as_deref().unwrap_or_default(),
                    checksum,
                    &self.owner,
                ),
            )
            .await?;
        }

        if let Some(fingergw) = self.instance.spec.fingergw.to_owned() {
            resource::upsert(
                kube.to_owned(),
                &objects::component_deployment(
                    &self.instance,
                    objects::FINGERGW_COMPONENT,
                    "zuul-fingergw",
                    fingergw.count.unwrap_or(1),
                    fingergw.env.as_deref().unwrap_or_default(),
                    checksum,
                    &self.owner,
                ),
            )
            .await?;
            resource::upsert(
                kube.to_owned(),
                &objects::component_service(
                    &self.instance,
                    objects::FINGERGW_COMPONENT,
                    9079,
                    &self.owner,
                ),
            )
            .await?;
        }

        if self.instance.spec.registry.is_some() {
            self.create_registry().await?;
        }

        self.create_nodepool().await
    }

    /// apply the image registry tier, its configuration is rebuilt from the
    /// user supplied document with the tls material and the generated rw
    /// user injected
    pub async fn create_registry(&mut self) -> Result<(), Error> {
        let registry = self.instance.spec.registry.to_owned().unwrap_or_default();

        let config = registry.config.as_ref().ok_or_else(|| {
            Error::MissingConfiguration("registry.config.secretName".to_string())
        })?;

        let obj = secret::find(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            &config.secret_name,
        )
        .await?
        .ok_or_else(|| Error::SecretMissing(config.secret_name.to_owned()))?;

        let payload = secret::data(&obj, REGISTRY_CONFIG_KEY).ok_or_else(|| {
            Error::SecretKeyMissing(
                config.secret_name.to_owned(),
                REGISTRY_CONFIG_KEY.to_string(),
            )
        })?;

        let mut document: serde_yaml::Mapping =
            serde_yaml::from_slice(&payload).map_err(Error::Yaml)?;

        // the rw credentials are generated once and reused afterwards
        let password = match secret::find(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            objects::REGISTRY_USER_SECRET,
        )
        .await?
        .and_then(|obj| secret::data(&obj, "password"))
        {
            Some(payload) => String::from_utf8(payload).map_err(Error::Decode)?,
            None => {
                let password = generate_password(PASSWORD_LENGTH);

                secret::upsert(
                    self.state.kube.to_owned(),
                    &self.instance.namespace,
                    objects::REGISTRY_USER_SECRET,
                    Some(&self.owner),
                    BTreeMap::from([
                        ("username".to_string(), "zuul".to_string()),
                        ("password".to_string(), password.to_owned()),
                    ]),
                )
                .await?;

                password
            }
        };

        let section = document
            .entry("registry".into())
            .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
        let section = section
            .as_mapping_mut()
            .ok_or_else(|| Error::MissingConfiguration("registry section".to_string()))?;

        section.insert("tls-cert".into(), "/tls/tls.crt".into());
        section.insert("tls-key".into(), "/tls/tls.key".into());

        let mut user = serde_yaml::Mapping::new();
        user.insert("name".into(), "zuul".into());
        user.insert("pass".into(), password.into());
        user.insert("access".into(), "write".into());
        section.insert(
            "users".into(),
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::Mapping(user)]),
        );

        let text = serde_yaml::to_string(&document).map_err(Error::Yaml)?;

        secret::upsert(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            objects::REGISTRY_CONFIG_SECRET,
            Some(&self.owner),
            BTreeMap::from([(REGISTRY_CONFIG_KEY.to_string(), text)]),
        )
        .await?;

        // without a user supplied key pair the certificate authority of the
        // instance issues one
        if registry.tls.and_then(|tls| tls.secret_name).is_none() {
            let certificate = json!({
                "apiVersion": "cert-manager.io/v1",
                "kind": "Certificate",
                "metadata": {
                    "name": objects::REGISTRY_TLS_SECRET,
                    "namespace": self.instance.namespace,
                },
                "spec": {
                    "secretName": objects::REGISTRY_TLS_SECRET,
                    "commonName": objects::REGISTRY_COMPONENT,
                    "dnsNames": [
                        objects::REGISTRY_COMPONENT,
                        format!("{}.{}", objects::REGISTRY_COMPONENT, self.instance.namespace),
                    ],
                    "usages": ["server auth"],
                    "issuerRef": {
                        "name": "ca-issuer",
                        "kind": "Issuer",
                        "group": "cert-manager.io",
                    },
                },
            });

            let obj: DynamicObject =
                serde_json::from_value(certificate).map_err(Error::Serialize)?;

            apply::object(
                &self.state.kube,
                obj,
                Some(&self.instance.namespace),
                Some(&self.owner),
            )
            .await
            .map_err(Error::Apply)?;
        }

        resource::upsert(
            self.state.kube.to_owned(),
            &objects::registry_statefulset(&self.instance, &self.owner),
        )
        .await?;
        resource::upsert(
            self.state.kube.to_owned(),
            &objects::component_service(
                &self.instance,
                objects::REGISTRY_COMPONENT,
                9000,
                &self.owner,
            ),
        )
        .await?;

        Ok(())
    }

    /// shard the nodepool configuration into per provider secrets and
    /// launcher deployments, then garbage collect the providers that left
    /// the desired set
    pub async fn create_nodepool(&mut self) -> Result<(), Error> {
        let obj = secret::find(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            &self.instance.nodepool_secret,
        )
        .await?
        .ok_or_else(|| Error::SecretMissing(self.instance.nodepool_secret.to_owned()))?;

        let payload = secret::data(&obj, launcher::NODEPOOL_CONFIG_KEY).ok_or_else(|| {
            Error::SecretKeyMissing(
                self.instance.nodepool_secret.to_owned(),
                launcher::NODEPOOL_CONFIG_KEY.to_string(),
            )
        })?;

        let document = String::from_utf8(payload).map_err(Error::Decode)?;
        let shards = launcher::shard(&document, &self.instance.zk_hosts)
            .map_err(Error::Launcher)?;

        let mut desired = BTreeSet::new();

        for (provider, text) in &shards {
            info!(
                namespace = self.instance.namespace,
                name = self.instance.name,
                provider = provider,
                "configure nodepool provider"
            );

            secret::upsert(
                self.state.kube.to_owned(),
                &self.instance.namespace,
                &launcher::shard_secret_name(&self.instance.name, provider),
                Some(&self.owner),
                BTreeMap::from([(launcher::NODEPOOL_CONFIG_KEY.to_string(), text.to_owned())]),
            )
            .await?;

            resource::upsert(
                self.state.kube.to_owned(),
                &objects::launcher_deployment(
                    &self.instance,
                    provider,
                    &launcher::shard_secret_name(&self.instance.name, provider),
                    &self.owner,
                ),
            )
            .await?;

            desired.insert(provider.to_owned());
        }

        // read the live provider set back from the cluster, the diff with
        // the desired set gives the orphans
        let selector = resource::selector(&[
            ("app.kubernetes.io/name", "nodepool"),
            ("app.kubernetes.io/instance", &self.instance.name),
            ("app.kubernetes.io/component", objects::LAUNCHER_COMPONENT),
            ("app.kubernetes.io/part-of", "zuul"),
        ]);

        let api: Api<Deployment> =
            Api::namespaced(self.state.kube.to_owned(), &self.instance.namespace);
        let deployments = api.list(&ListParams::default().labels(&selector)).await?;

        let current: BTreeSet<String> = deployments
            .items
            .iter()
            .filter_map(|deployment| deployment.labels().get(launcher::PROVIDER_LABEL).cloned())
            .collect();

        for provider in launcher::orphans(&current, &desired) {
            info!(
                namespace = self.instance.namespace,
                name = self.instance.name,
                provider = provider,
                "delete unused nodepool provider"
            );

            resource::delete_opt::<Deployment>(
                self.state.kube.to_owned(),
                &self.instance.namespace,
                &launcher::launcher_deployment_name(&self.instance.name, &provider),
            )
            .await?;

            resource::delete_opt::<Secret>(
                self.state.kube.to_owned(),
                &self.instance.namespace,
                &launcher::shard_secret_name(&self.instance.name, &provider),
            )
            .await?;
        }

        Ok(())
    }

    pub async fn wait_for_scheduler_rollout(&mut self) -> Result<(), Error> {
        poll::wait_for_statefulset(
            &self.state.kube,
            &self.instance.namespace,
            objects::SCHEDULER_COMPONENT,
            &self.poller(),
        )
        .await
        .map_err(Error::Wait)
    }

    /// push the updated tenant configuration to the running schedulers, each
    /// pod first proves through a checksum that the new file landed on disk,
    /// a pod that never converges is logged and skipped
    pub async fn smart_reconfigure(&mut self) -> Result<(), Error> {
        let obj = secret::find(
            self.state.kube.to_owned(),
            &self.instance.namespace,
            &self.instance.tenant_secret,
        )
        .await?
        .ok_or_else(|| Error::SecretMissing(self.instance.tenant_secret.to_owned()))?;

        let payload = secret::data(&obj, TENANT_CONFIG_KEY).ok_or_else(|| {
            Error::SecretKeyMissing(
                self.instance.tenant_secret.to_owned(),
                TENANT_CONFIG_KEY.to_string(),
            )
        })?;

        let expected = format!(
            "{}  {}",
            conf::checksum(&payload),
            conf::TENANT_CONFIG_PATH
        );

        let selector = objects::labels(&self.instance.name, objects::SCHEDULER_COMPONENT)
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");

        let api: Api<Pod> =
            Api::namespaced(self.state.kube.to_owned(), &self.instance.namespace);
        let pods = api.list(&ListParams::default().labels(&selector)).await?;

        for pod in &pods.items {
            let name = pod.name_any();

            info!(
                namespace = self.instance.namespace,
                pod = name,
                "wait for tenant configuration to land on disk"
            );

            // in-pod bounded polling loop, 30 retries of 10 seconds
            let command = vec![
                "/usr/bin/timeout".to_string(),
                "300".to_string(),
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!(
                    "while !( echo -n \"{expected}\" | sha256sum -c - ); do sleep 10; done"
                ),
            ];

            let output =
                match exec::pod_exec(&self.state.kube, &self.instance.namespace, &name, command)
                    .await
                {
                    Ok(output) => output,
                    Err(err) => {
                        error!(
                            namespace = self.instance.namespace,
                            pod = name,
                            error = err.to_string(),
                            "failed to verify tenant configuration"
                        );
                        continue;
                    }
                };

            debug!(pod = name, output = output, "checksum verification output");

            if !output.contains(&format!("{}: OK", conf::TENANT_CONFIG_PATH)) {
                error!(
                    namespace = self.instance.namespace,
                    pod = name,
                    "tenant configuration never landed on disk"
                );
                continue;
            }

            info!(
                namespace = self.instance.namespace,
                pod = name,
                "issue smart-reconfigure"
            );

            if let Err(err) = exec::pod_exec(
                &self.state.kube,
                &self.instance.namespace,
                &name,
                vec![
                    "zuul-scheduler".to_string(),
                    "smart-reconfigure".to_string(),
                ],
            )
            .await
            {
                error!(
                    namespace = self.instance.namespace,
                    pod = name,
                    error = err.to_string(),
                    "failed to issue smart-reconfigure"
                );
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<Zuul> for Reconciler {
    fn build(&self, state: State) -> Controller<Zuul> {
        Controller::new(Api::all(state.kube), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<Zuul> for Reconciler {
    type Error = Error;

    async fn upsert(ctx: Arc<State>, origin: Arc<Zuul>) -> Result<(), Error> {
        let kube = ctx.kube.to_owned();
        let (namespace, name) = resource::namespaced_name(&*origin);

        let mut engine = Engine::new(ctx.to_owned(), &origin);

        let checksum = match crd::last_applied(&origin).map_err(Error::Serialize)? {
            None => {
                info!(namespace = namespace, name = name, "create zuul deployment");

                let checksum = engine.create().await?;

                let action = &Action::Create;
                let message = "Create zuul deployment and its dependencies";
                recorder::normal(kube.to_owned(), &*origin, action, message).await?;

                checksum
            }
            Some(old) => {
                let changes = crd::classify(&old, &origin.spec).map_err(Error::Serialize)?;

                if !changes.any() {
                    debug!(
                        namespace = namespace,
                        name = name,
                        "specification is unchanged, nothing to reconcile"
                    );
                    return Ok(());
                }

                info!(
                    namespace = namespace,
                    name = name,
                    conf_changed = changes.conf_changed,
                    spec_changed = changes.spec_changed,
                    "update zuul deployment"
                );

                let checksum = engine.update(&changes).await?;

                let action = &Action::Update;
                let message = "Update zuul deployment";
                recorder::normal(kube.to_owned(), &*origin, action, message).await?;

                checksum
            }
        };

        // record the applied specification and the configuration checksum so
        // the next event can be classified against them
        let mut modified = (*origin).to_owned();
        crd::record_applied(&mut modified).map_err(Error::Serialize)?;
        modified.set_config_checksum(Some(checksum));

        let patch = resource::diff(&*origin, &modified).map_err(Error::Diff)?;
        let modified = resource::patch(kube.to_owned(), &modified, patch.to_owned()).await?;
        resource::patch_status(kube.to_owned(), modified, patch).await?;

        index::rebuild(&ctx.kube, &ctx.index).await?;
        Ok(())
    }

    async fn delete(ctx: Arc<State>, origin: Arc<Zuul>) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        // owned objects are cascade-deleted through their owner references,
        // un-owned installers are deliberately left behind
        info!(
            namespace = namespace,
            name = name,
            "zuul deployment deleted, owned objects are garbage collected"
        );

        index::rebuild(&ctx.kube, &ctx.index).await?;
        Ok(())
    }

    fn retry(_obj: Arc<Zuul>, err: &Error, ctx: Arc<State>) -> ReconcileAction {
        if err.is_permanent() {
            error!(
                error = err.to_string(),
                "reconciliation failed permanently, wait for the specification to change"
            );
            return ReconcileAction::await_change();
        }

        let delay = std::time::Duration::from_secs(ctx.config.operator.requeue_delay);

        warn!(
            error = err.to_string(),
            duration = delay.as_secs(),
            "requeue failed reconciliation"
        );
        ReconcileAction::requeue(delay)
    }
}

// -----------------------------------------------------------------------------
// Secret watcher

/// listen to secret update events across the cluster and trigger a targeted
/// partial action on the instances depending on them, a tenant configuration
/// change triggers a live reconfiguration, a launcher configuration change
/// recreates the launcher tier
pub async fn watch_secrets(state: State) -> Result<(), Error> {
    let api: Api<Secret> = Api::all(state.kube.to_owned());
    let context = Arc::new(state.to_owned());
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();

    while let Some(event) = stream.try_next().await.map_err(Error::Watch)? {
        // the initial synchronization replays every secret of the cluster,
        // only genuine updates are acted on
        let obj = match event {
            watcher::Event::Applied(obj) => obj,
            _ => continue,
        };

        let namespace = match obj.namespace() {
            Some(namespace) => namespace,
            None => continue,
        };

        let name = obj.name_any();

        if !state.index.matches(&namespace, &name) {
            continue;
        }

        debug!(
            namespace = namespace,
            name = name,
            "secret update matches the dependency index"
        );

        for edge in state.index.affected(&namespace, &name) {
            info!(
                namespace = edge.namespace,
                name = edge.zuul_name,
                secret = name,
                "secret update affects zuul deployment"
            );

            let api: Api<Zuul> = Api::namespaced(state.kube.to_owned(), &edge.namespace);
            let zuul = match api.get_opt(&edge.zuul_name).await {
                Ok(Some(zuul)) => zuul,
                Ok(None) => continue,
                Err(err) => {
                    error!(
                        namespace = edge.namespace,
                        name = edge.zuul_name,
                        error = err.to_string(),
                        "failed to retrieve zuul deployment"
                    );
                    continue;
                }
            };

            let mut engine = Engine::new(context.to_owned(), &zuul);

            let (action, result) = match edge.attribute {
                index::Attribute::TenantConfig => (
                    Action::SmartReconfigure,
                    engine.smart_reconfigure().await,
                ),
                index::Attribute::LauncherConfig => {
                    (Action::UpsertNodepool, engine.create_nodepool().await)
                }
            };

            match result {
                Ok(_) => {
                    let message = &format!("React to update of secret '{name}'");
                    if let Err(err) =
                        recorder::normal(state.kube.to_owned(), &zuul, &action, message).await
                    {
                        warn!(
                            namespace = edge.namespace,
                            name = edge.zuul_name,
                            error = err.to_string(),
                            "failed to record event"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        namespace = edge.namespace,
                        name = edge.zuul_name,
                        action = action.to_string(),
                        error = err.to_string(),
                        "failed to react to secret update"
                    );
                }
            }
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{generate_password, Instance};

    fn spec(value: serde_json::Value) -> crate::svc::crd::ZuulSpec {
        serde_json::from_value(value).expect("specification to deserialize")
    }

    #[test]
    fn database_is_self_managed_when_no_secret_is_given() {
        let instance = Instance::normalize(
            "zuul",
            "ci",
            spec(json!({
                "scheduler": {"config": {"secretName": "zuul-tenant-config"}},
                "launcher": {"config": {"secretName": "nodepool-config"}},
            })),
        );

        assert!(instance.manage_db);
        assert_eq!(instance.db_secret, "zuul-db");
        assert!(!instance.allow_unsafe_db);
        assert!(instance.manage_zk);
        assert_eq!(instance.zk_hosts, "zookeeper.ci:2281");
        assert_eq!(instance.zk_secret, "zookeeper-client-tls");
    }

    #[test]
    fn external_dependencies_are_not_managed() {
        let instance = Instance::normalize(
            "zuul",
            "ci",
            spec(json!({
                "database": {"secretName": "external-db"},
                "zookeeper": {"hosts": "zk.example.org:2281", "secretName": "zk-tls"},
                "scheduler": {"config": {"secretName": "zuul-tenant-config"}},
                "launcher": {"config": {"secretName": "nodepool-config"}},
            })),
        );

        assert!(!instance.manage_db);
        assert_eq!(instance.db_secret, "external-db");
        assert!(!instance.manage_zk);
        assert_eq!(instance.zk_hosts, "zk.example.org:2281");
        assert_eq!(instance.zk_secret, "zk-tls");
    }

    #[test]
    fn reserved_environment_variables_are_force_set() {
        let instance = Instance::normalize(
            "zuul",
            "ci",
            spec(json!({
                "scheduler": {"config": {"secretName": "zuul-tenant-config"}},
                "launcher": {"config": {"secretName": "nodepool-config"}},
            })),
        );

        let env = instance.normalized_env(&[
            crate::svc::crd::EnvValue {
                name: "KUBECONFIG".to_string(),
                value: "/home/user/kube/config".to_string(),
            },
            crate::svc::crd::EnvValue {
                name: "HTTP_PROXY".to_string(),
                value: "http://proxy:3128".to_string(),
            },
        ]);

        let kubeconfig: Vec<_> = env
            .iter()
            .filter(|variable| variable.name == "KUBECONFIG")
            .collect();

        assert_eq!(kubeconfig.len(), 1);
        assert_eq!(
            kubeconfig[0].value.as_deref(),
            Some(super::RESERVED_KUBECONFIG)
        );
        assert!(env.iter().any(|variable| variable.name == "HTTP_PROXY"));
    }

    #[test]
    fn images_are_derived_from_prefix_and_versions() {
        let instance = Instance::normalize(
            "zuul",
            "ci",
            spec(json!({
                "imagePrefix": "registry.example.org/ci",
                "zuulImageVersion": "4.2.0",
                "scheduler": {"config": {"secretName": "zuul-tenant-config"}},
                "launcher": {"config": {"secretName": "nodepool-config"}},
            })),
        );

        assert_eq!(
            instance.zuul_image("zuul-scheduler"),
            "registry.example.org/ci/zuul-scheduler:4.2.0"
        );
        assert_eq!(
            instance.nodepool_image("nodepool-launcher"),
            "registry.example.org/ci/nodepool-launcher:4.1.0"
        );
    }

    #[test]
    fn generated_passwords_are_random() {
        let first = generate_password(32);
        let second = generate_password(32);

        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }
}
