//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{io, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    http,
    k8s::{client, State, Watcher},
    zuul::{self, index::SecretIndex},
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"])]
    #[clap(subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| {
                    Error::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

impl paw::ParseArgs for Args {
    type Error = clap::Error;

    fn parse_args() -> Result<Self, Self::Error> {
        Self::try_parse()
    }
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube = client::try_new(kubeconfig).await.map_err(Error::Client)?;

    // -------------------------------------------------------------------------
    // Create state to give to each reconciler
    let index = Arc::new(SecretIndex::new());
    let state = State::new(kube, config.to_owned(), index);

    // the index is also rebuilt after each reconciliation, a failure here
    // only delays secret update reactions
    if let Err(err) = zuul::index::rebuild(&state.kube, &state.index).await {
        error!(
            error = err.to_string(),
            "could not build the secret dependency index"
        );
    }

    // -------------------------------------------------------------------------
    // Create reconcilers and ancillary tasks
    let mut handles = vec![];

    let listen = config.operator.listen.to_owned();
    handles.push(tokio::spawn(async move {
        info!(addr = listen.to_string(), "start the health http server");
        if let Err(err) = http::server::serve(http::server::router(), listen).await {
            error!(
                error = err.to_string(),
                "could not serve the health http server"
            );
        }

        abort();
    }));

    let watcher_state = state.to_owned();
    handles.push(tokio::spawn(async move {
        let reconciler = zuul::Reconciler::default();

        info!("start to listen for events of zuul custom resource");
        if let Err(err) = reconciler.watch(watcher_state).await {
            error!(
                error = err.to_string(),
                "could not reconcile zuul custom resource"
            );
        }

        abort();
    }));

    let secrets_state = state.to_owned();
    handles.push(tokio::spawn(async move {
        info!("start to listen for events of configuration secrets");
        if let Err(err) = zuul::watch_secrets(secrets_state).await {
            error!(
                error = err.to_string(),
                "could not watch configuration secrets"
            );
        }

        abort();
    }));

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(Error::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel reconcilers
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(
                    error = err.to_string(),
                    "could not wait for the task to complete"
                );
            }
        }
    }

    Ok(())
}
