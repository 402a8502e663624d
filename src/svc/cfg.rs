//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_POLL_INTERVAL: u64 = 10;
pub const DEFAULT_REQUEUE_DELAY: u64 = 10;

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
}

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    /// address the health and telemetry endpoint binds to
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    /// interval in seconds between two readiness polls of a dependency
    #[serde(rename = "pollInterval")]
    pub poll_interval: u64,
    /// delay in seconds before a failed reconciliation is retried
    #[serde(rename = "requeueDelay")]
    pub requeue_delay: u64,
}

// -----------------------------------------------------------------------------
// Configuration structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(File::from(path.to_owned()).required(true))
            .build()
            .map_err(|err| Error::File(path, err))?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults()?;

        for path in [
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from("config"),
        ] {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

// -----------------------------------------------------------------------------
// helpers

fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, Error> {
    Ok(Config::builder()
        .set_default("operator.listen", DEFAULT_LISTEN)
        .map_err(|err| Error::Default("operator.listen".into(), err))?
        .set_default("operator.pollInterval", DEFAULT_POLL_INTERVAL)
        .map_err(|err| Error::Default("operator.pollInterval".into(), err))?
        .set_default("operator.requeueDelay", DEFAULT_REQUEUE_DELAY)
        .map_err(|err| Error::Default("operator.requeueDelay".into(), err))?
        .add_source(
            Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__"),
        ))
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::Configuration;

    #[test]
    fn defaults_are_applied() {
        let config = Configuration::try_default().expect("configuration to build from defaults");

        assert_eq!(config.operator.listen.port(), 8000);
        assert_eq!(config.operator.poll_interval, 10);
        assert_eq!(config.operator.requeue_delay, 10);
    }
}
