//! Reading the network configuration the runtime passes on stdin.

use std::io::{self, Read};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::datastore::etcd::{ETCD_AUTHORITY_ENV, ETCD_ENDPOINTS_ENV};
use crate::network::cni::args::Environment;
use crate::network::cni::schema::NetworkConfiguration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read network configuration")]
    Read(#[source] io::Error),

    #[error("network configuration is neither JSON nor YAML")]
    Syntax(#[source] serde_yaml::Error),

    #[error("network configuration is missing required fields")]
    Invalid(#[source] serde_json::Error),

    #[error("could not determine hostname")]
    Hostname(#[source] nix::Error),
}

/// Reads the configuration as both the raw document, which is handed to IPAM plugins unchanged, and its typed form.
pub fn read_network_config<R: Read>(mut input: R) -> Result<(Value, NetworkConfiguration), ConfigError> {
    let mut raw = String::new();
    input.read_to_string(&mut raw).map_err(ConfigError::Read)?;

    // JSON is a subset of YAML, so this takes either.
    let value: Value = serde_yaml::from_str(&raw).map_err(ConfigError::Syntax)?;
    let config = serde_json::from_value(value.clone()).map_err(ConfigError::Invalid)?;
    Ok((value, config))
}

/// Copies the configured etcd location into the environment, where both the datastore client and IPAM plugin
/// processes pick it up.
pub fn export_etcd_settings(config: &NetworkConfiguration, env: &mut Environment) {
    if let Some(authority) = &config.etcd_authority {
        debug!("Using {}={}", ETCD_AUTHORITY_ENV, authority);
        env.insert(ETCD_AUTHORITY_ENV.into(), authority.clone());
    }
    if let Some(endpoints) = &config.etcd_endpoints {
        debug!("Using {}={}", ETCD_ENDPOINTS_ENV, endpoints);
        env.insert(ETCD_ENDPOINTS_ENV.into(), endpoints.clone());
    }
}

/// The host to register endpoints under: the configured `hostname`, else the system's.
pub fn hostname(config: &NetworkConfiguration) -> Result<String, ConfigError> {
    match &config.hostname {
        Some(hostname) => Ok(hostname.clone()),
        None => nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .map_err(ConfigError::Hostname),
    }
}
