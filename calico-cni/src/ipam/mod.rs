//! Address assignment through the configured IPAM plugin.
//!
//! `calico-ipam` is handled in-process by [`calico::CalicoIpam`]; any other type is run as a CNI plugin binary
//! found on `CNI_PATH`. Either way the result comes back as a return code plus the JSON the plugin would have
//! printed, so both paths are parsed identically.

use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::datastore::IpamStore;
use crate::network::cni::args::{Command, Environment};
use crate::network::cni::schema::{
    parse_address, CniError, ErrorCode, IpConfiguration, IpamConfiguration, IpamResult, ERR_CODE_GENERIC,
};

pub mod calico;
pub mod exec;

/// IPAM type served by the in-process allocator.
pub const CALICO_IPAM_TYPE: &str = "calico-ipam";

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("Could not find IPAM plugin of type {plugin_type} in path {cni_path}.")]
    PluginNotFound { plugin_type: String, cni_path: String },

    #[error("could not run IPAM plugin {}", path.display())]
    Exec {
        path: PathBuf,
        #[source]
        error: unshare::Error,
    },

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: io::Error,
    },

    #[error("Failed to parse IPAM response, exiting")]
    InvalidResponse {
        output: String,
        #[source]
        error: serde_json::Error,
    },

    /// The plugin itself reported an error. Its code, message and details are passed through unchanged.
    #[error("{0}")]
    Plugin(CniError),

    #[error("Invalid or Empty {family} address: {value}")]
    InvalidAddress { family: &'static str, value: String },

    #[error("IPAM plugin did not return any valid addresses.")]
    NoAddresses,
}

/// What an IPAM plugin run produced: its return code and whatever it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamOutput {
    pub code: i32,
    pub output: String,
}

/// Runs an IPAM plugin with the given command, environment and full network configuration.
pub trait IpamInvoker {
    fn invoke(&self, command: Command, env: &Environment, config: &Value) -> Result<IpamOutput, IpamError>;
}

/// Addresses assigned by an IPAM `ADD`.
#[derive(Debug, Clone, PartialEq)]
pub struct IpamAllocation {
    pub ipv4: Option<Ipv4Network>,
    pub ipv6: Option<Ipv6Network>,

    /// The plugin's result, echoed back to the runtime.
    pub result: IpamResult,
}

impl IpamAllocation {
    pub fn networks(&self) -> Vec<IpNetwork> {
        self.ipv4
            .map(IpNetwork::V4)
            .into_iter()
            .chain(self.ipv6.map(IpNetwork::V6))
            .collect()
    }
}

/// Picks between the in-process allocator and a plugin binary based on the configured IPAM type.
pub struct DefaultIpamInvoker<'a> {
    plugin_type: String,
    cni_path: String,
    store: &'a dyn IpamStore,
}

impl<'a> DefaultIpamInvoker<'a> {
    pub fn new<T: Into<String>, P: Into<String>>(plugin_type: T, cni_path: P, store: &'a dyn IpamStore) -> Self {
        DefaultIpamInvoker {
            plugin_type: plugin_type.into(),
            cni_path: cni_path.into(),
            store,
        }
    }

    fn invoke_calico(&self, command: Command, env: &Environment, config: &Value) -> IpamOutput {
        info!("Using Calico IPAM");
        let outcome = serde_json::from_value::<IpamConfiguration>(config.get("ipam").cloned().unwrap_or(Value::Null))
            .map_err(|err| CniError::generic("Invalid IPAM configuration").with_details(err.to_string()))
            .and_then(|ipam| {
                calico::CalicoIpam::new(self.store)
                    .execute(command, env, &ipam)
                    .map_err(CniError::from)
            });

        match outcome {
            Ok(Some(result)) => IpamOutput {
                code: 0,
                output: serde_json::to_string(&result).expect("IPAM results are always serializable"),
            },
            Ok(None) => IpamOutput {
                code: 0,
                output: String::new(),
            },
            Err(err) => IpamOutput {
                code: err.exit_code(),
                output: serde_json::to_string(&err).expect("CNI errors are always serializable"),
            },
        }
    }
}

impl IpamInvoker for DefaultIpamInvoker<'_> {
    fn invoke(&self, command: Command, env: &Environment, config: &Value) -> Result<IpamOutput, IpamError> {
        let output = if self.plugin_type == CALICO_IPAM_TYPE {
            self.invoke_calico(command, env, config)
        } else {
            debug!("Using binary plugin");
            let path = exec::find_plugin(&self.plugin_type, &self.cni_path)?;
            info!("Using IPAM plugin at: {}", path.display());
            exec::run_plugin(&path, env, config)?
        };
        debug!("IPAM response (rc={}): {}", output.code, output.output);
        Ok(output)
    }
}

/// Assigns addresses by running IPAM in `ADD` mode.
#[tracing::instrument(skip(invoker, env, config))]
pub fn assign(invoker: &dyn IpamInvoker, env: &Environment, config: &Value) -> Result<IpamAllocation, IpamError> {
    debug!("Assigning IP address");
    let IpamOutput { code, output } = invoker.invoke(Command::Add, env, config)?;
    parse_assignment(code, &output)
}

/// Releases addresses by running IPAM in `DEL` mode. Failures are only logged: an orphaned lease is better than a
/// delete that can never complete.
#[tracing::instrument(skip(invoker, env, config))]
pub fn release(invoker: &dyn IpamInvoker, env: &Environment, config: &Value) {
    info!("Releasing IP address");
    match invoker.invoke(Command::Del, env, config) {
        Ok(IpamOutput { code: 0, .. }) => (),
        Ok(IpamOutput { code, output }) => {
            error!("IPAM plugin failed to release IP address (rc={}): {}", code, output)
        }
        Err(err) => error!("IPAM plugin failed to release IP address: {}", err),
    }
}

/// Interprets the output of an IPAM `ADD`.
pub fn parse_assignment(code: i32, output: &str) -> Result<IpamAllocation, IpamError> {
    let value: Value = serde_json::from_str(output).map_err(|error| {
        error!("Failed to parse IPAM response: {:?}", output);
        IpamError::InvalidResponse {
            output: output.into(),
            error,
        }
    })?;

    if code != 0 {
        error!("IPAM plugin error (rc={}): {}", code, output);
        return Err(IpamError::Plugin(plugin_error(&value)));
    }

    let result: IpamResult = serde_json::from_value(value).map_err(|error| IpamError::InvalidResponse {
        output: output.into(),
        error,
    })?;

    let ipv4 = match &result.ip4 {
        Some(ip4) => match parse_address(&ip4.ip) {
            Ok(IpNetwork::V4(net)) => {
                info!("IPAM plugin assigned IPv4 address: {}", net);
                Some(net)
            }
            _ => return Err(invalid_address("IPv4", ip4)),
        },
        None => None,
    };

    let ipv6 = match &result.ip6 {
        Some(ip6) => match parse_address(&ip6.ip) {
            Ok(IpNetwork::V6(net)) => {
                info!("IPAM plugin assigned IPv6 address: {}", net);
                Some(net)
            }
            _ => return Err(invalid_address("IPv6", ip6)),
        },
        None => None,
    };

    if ipv4.is_none() && ipv6.is_none() {
        warn!("Bad IPAM plugin response: {}", output);
        return Err(IpamError::NoAddresses);
    }

    Ok(IpamAllocation { ipv4, ipv6, result })
}

fn invalid_address(family: &'static str, ip: &IpConfiguration) -> IpamError {
    error!("Invalid or Empty {} address: {:?}", family, ip.ip);
    IpamError::InvalidAddress {
        family,
        value: ip.ip.clone(),
    }
}

/// Rebuilds a failed plugin's error from its output, filling in whatever it left out.
fn plugin_error(output: &Value) -> CniError {
    let code = output
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|code| u32::try_from(code).ok())
        .filter(|code| *code != 0)
        .unwrap_or(ERR_CODE_GENERIC);
    CniError {
        code: ErrorCode::from(code),
        message: output
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("Unknown IPAM error")
            .into(),
        details: output.get("details").and_then(Value::as_str).map(String::from),
    }
}
