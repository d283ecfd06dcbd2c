//! Calico's own IPAM: hands out single addresses from the configured pools.
//!
//! Addresses are claimed one at a time under the workload's handle, so a `DEL` can release everything a workload
//! holds without knowing which addresses it got.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::datastore::{DatastoreError, IpamStore};
use crate::network::cni::args::{
    parse_cni_args, ArgsError, Command, Environment, CNI_ARGS_ENV, CNI_ARGS_IP, CNI_COMMAND_ENV,
    CNI_CONTAINERID_ENV, K8S_POD_NAME, K8S_POD_NAMESPACE,
};
use crate::network::cni::schema::{CniError, IpConfiguration, IpamConfiguration, IpamResult, ERR_CODE_GENERIC};
use crate::plugin::fallback::try_keys;

#[derive(Debug, Error)]
pub enum CalicoIpamError {
    #[error("Invalid arguments")]
    Args(#[source] ArgsError),

    #[error("Failed to assign IP address")]
    Assign { details: String },

    #[error("No IPv{version} addresses available in pool")]
    Exhausted { version: u8 },

    #[error("datastore error: {context}")]
    Datastore {
        context: String,
        #[source]
        error: DatastoreError,
    },
}

impl From<CalicoIpamError> for CniError {
    fn from(err: CalicoIpamError) -> CniError {
        let message = err.to_string();
        match err {
            CalicoIpamError::Args(source) => CniError::generic(message).with_details(source.to_string()),
            CalicoIpamError::Assign { details } => CniError::generic(message).with_details(details),
            CalicoIpamError::Exhausted { .. } => CniError::generic(message),
            CalicoIpamError::Datastore { error, .. } => CniError::generic(message).with_details(error.to_string()),
        }
    }
}

/// The workload an IPAM request is for, as seen from the CNI environment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IpamRequest {
    container_id: String,
    workload_id: String,
    /// Specific IPv4 address asked for through `CNI_ARGS`.
    requested: Option<String>,
}

impl IpamRequest {
    fn new(env: &Environment) -> Result<IpamRequest, CalicoIpamError> {
        let container_id = env
            .get(CNI_CONTAINERID_ENV)
            .cloned()
            .ok_or(CalicoIpamError::Args(ArgsError::Missing(CNI_CONTAINERID_ENV)))?;
        let cni_args = parse_cni_args(env.get(CNI_ARGS_ENV).map(String::as_str).unwrap_or(""));

        let workload_id = match (cni_args.get(K8S_POD_NAMESPACE), cni_args.get(K8S_POD_NAME)) {
            (Some(namespace), Some(pod)) => format!("{}.{}", namespace, pod),
            _ => container_id.clone(),
        };

        Ok(IpamRequest {
            container_id,
            workload_id,
            requested: cni_args.get(CNI_ARGS_IP).cloned(),
        })
    }
}

pub struct CalicoIpam<'a> {
    store: &'a dyn IpamStore,
}

impl<'a> CalicoIpam<'a> {
    pub fn new(store: &'a dyn IpamStore) -> CalicoIpam<'a> {
        CalicoIpam { store }
    }

    /// Assigns (`ADD`) or releases (`DEL`) addresses for the workload described by `env`. Only `ADD` has a result.
    #[tracing::instrument(skip(self, env, ipam))]
    pub fn execute(
        &self,
        command: Command,
        env: &Environment,
        ipam: &IpamConfiguration,
    ) -> Result<Option<IpamResult>, CalicoIpamError> {
        let request = IpamRequest::new(env)?;
        match command {
            Command::Add => {
                let result = match &request.requested {
                    Some(requested) => {
                        info!("User assigned address: {} for workload: {}", requested, request.workload_id);
                        self.assign_requested(requested, &request.workload_id, ipam)?
                    }
                    None => {
                        info!("Assigning address to workload: {}", request.workload_id);
                        self.auto_assign(&request.workload_id, ipam)?
                    }
                };
                debug!("Returning response: {:?}", result);
                Ok(Some(result))
            }
            Command::Del => {
                self.release(&request)?;
                Ok(None)
            }
        }
    }

    fn auto_assign(&self, handle: &str, ipam: &IpamConfiguration) -> Result<IpamResult, CalicoIpamError> {
        let assign_ipv4 = ipam.assign_ipv4.unwrap_or(true);
        let assign_ipv6 = ipam.assign_ipv6.unwrap_or(false);
        info!(
            "Assigning {} IPv4 and {} IPv6 addresses",
            assign_ipv4 as u8, assign_ipv6 as u8
        );

        let mut result = IpamResult::default();
        if assign_ipv4 {
            let address = self.assign_from_pools(4, handle, ipam)?;
            result.ip4 = Some(IpConfiguration::new(IpNetwork::from(address).to_string()));
        }
        if assign_ipv6 {
            match self.assign_from_pools(6, handle, ipam) {
                Ok(address) => result.ip6 = Some(IpConfiguration::new(IpNetwork::from(address).to_string())),
                Err(err) => {
                    // Don't leak the IPv4 address claimed above.
                    if assign_ipv4 {
                        if let Err(release_err) = self.store.release_by_handle(handle) {
                            warn!("Could not release addresses of {}: {}", handle, release_err);
                        }
                    }
                    return Err(err);
                }
            }
        }

        info!("Assigned IPv4: {:?}, IPv6: {:?}", result.ip4, result.ip6);
        Ok(result)
    }

    fn assign_requested(
        &self,
        requested: &str,
        handle: &str,
        ipam: &IpamConfiguration,
    ) -> Result<IpamResult, CalicoIpamError> {
        let address: Ipv4Addr = requested.parse().map_err(|_| {
            error!("User requested IP: {} is invalid", requested);
            CalicoIpamError::Assign {
                details: format!("invalid IPv4 address {:?}", requested),
            }
        })?;
        let address = IpAddr::V4(address);

        if !self.pools(4, ipam)?.iter().any(|pool| pool.contains(address)) {
            return Err(CalicoIpamError::Assign {
                details: format!("{} is not in any configured IP pool", address),
            });
        }

        match self.store.claim_address(address, handle) {
            Ok(()) => (),
            Err(DatastoreError::AlreadyExists(_)) => {
                error!("User requested IP: {} is already assigned", address);
                return Err(CalicoIpamError::Assign {
                    details: format!("{} is already assigned", address),
                });
            }
            Err(error) => {
                return Err(CalicoIpamError::Datastore {
                    context: format!("could not assign {}", address),
                    error,
                })
            }
        }

        Ok(IpamResult {
            ip4: Some(IpConfiguration::new(IpNetwork::from(address).to_string())),
            ..IpamResult::default()
        })
    }

    /// Pools for an address family: `ipam.subnet` if it is of that family, otherwise the datastore's pools.
    fn pools(&self, version: u8, ipam: &IpamConfiguration) -> Result<Vec<IpNetwork>, CalicoIpamError> {
        if let Some(subnet) = ipam.subnet.filter(|subnet| family(subnet) == version) {
            return Ok(vec![subnet]);
        }
        self.store.ip_pools(version).map_err(|error| CalicoIpamError::Datastore {
            context: format!("could not read IPv{} pools", version),
            error,
        })
    }

    fn assign_from_pools(&self, version: u8, handle: &str, ipam: &IpamConfiguration) -> Result<IpAddr, CalicoIpamError> {
        for pool in self.pools(version, ipam)? {
            let assigned = self
                .store
                .assigned_addresses(&pool)
                .map_err(|error| CalicoIpamError::Datastore {
                    context: format!("could not read assignments in {}", pool),
                    error,
                })?;

            for address in pool.iter().filter(|addr| is_host_address(&pool, *addr)) {
                if assigned.contains(&address) {
                    continue;
                }
                match self.store.claim_address(address, handle) {
                    Ok(()) => return Ok(address),
                    // Someone else got there first.
                    Err(DatastoreError::AlreadyExists(_)) => continue,
                    Err(error) => {
                        return Err(CalicoIpamError::Datastore {
                            context: format!("could not assign {}", address),
                            error,
                        })
                    }
                }
            }
        }
        error!("No IPv{} address available, exiting", version);
        Err(CalicoIpamError::Exhausted { version })
    }

    fn release(&self, request: &IpamRequest) -> Result<(), CalicoIpamError> {
        info!("Releasing addresses on workload: {}", request.workload_id);
        match try_keys(&request.workload_id, &request.container_id, |handle| {
            self.store.release_by_handle(handle)
        }) {
            Ok(released) => {
                debug!("Released {:?}", released);
                Ok(())
            }
            Err(err) if err.is_absent() => {
                warn!("No IPs assigned to workload: {}", request.workload_id);
                Ok(())
            }
            Err(error) => Err(CalicoIpamError::Datastore {
                context: format!("could not release addresses of {}", request.workload_id),
                error,
            }),
        }
    }
}

fn family(net: &IpNetwork) -> u8 {
    match net {
        IpNetwork::V4(_) => 4,
        IpNetwork::V6(_) => 6,
    }
}

/// Excludes the network address (and the IPv4 broadcast address) of pools large enough to have them.
fn is_host_address(pool: &IpNetwork, address: IpAddr) -> bool {
    match pool {
        IpNetwork::V4(net) if net.prefix() < 31 => {
            address != IpAddr::V4(net.network()) && address != IpAddr::V4(net.broadcast())
        }
        IpNetwork::V6(net) if net.prefix() < 127 => address != IpAddr::V6(net.network()),
        _ => true,
    }
}

/// Runs the allocator as the standalone `calico-ipam` plugin: the command comes from `CNI_COMMAND`, the result or
/// error is written to `out`, and the return value is the process exit code.
pub fn run_standalone<W: Write>(env: &Environment, config: &Value, store: &dyn IpamStore, mut out: W) -> i32 {
    let outcome = env
        .get(CNI_COMMAND_ENV)
        .ok_or(ArgsError::Missing(CNI_COMMAND_ENV))
        .and_then(|command| Command::parse(command.as_str()))
        .map_err(|err| CniError::from(CalicoIpamError::Args(err)))
        .and_then(|command| {
            let ipam = serde_json::from_value::<IpamConfiguration>(config.get("ipam").cloned().unwrap_or(Value::Null))
                .map_err(|err| CniError::generic("Invalid IPAM configuration").with_details(err.to_string()))?;
            CalicoIpam::new(store)
                .execute(command, env, &ipam)
                .map_err(CniError::from)
        });

    match outcome {
        Ok(Some(result)) => {
            let written = serde_json::to_writer(&mut out, &result)
                .map_err(std::io::Error::from)
                .and_then(|_| writeln!(out));
            if let Err(err) = written {
                error!("Could not write IPAM result: {}", err);
                return ERR_CODE_GENERIC as i32;
            }
            0
        }
        Ok(None) => 0,
        Err(err) => {
            error!("{}", err);
            if let Err(write_err) = err.write_to(&mut out) {
                error!("Could not write error: {}", write_err);
            }
            err.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::cni::args::tests::environment;
    use crate::testing::MemoryStore;

    fn ipam_config(value: Value) -> IpamConfiguration {
        serde_json::from_value(value).unwrap()
    }

    fn store_with_pool(pool: &str) -> MemoryStore {
        let store = MemoryStore::default();
        store.add_pool(pool.parse().unwrap());
        store
    }

    #[test]
    fn test_auto_assign_skips_taken_addresses() {
        let store = store_with_pool("10.0.0.0/30");
        store.claim_address("10.0.0.1".parse().unwrap(), "other").unwrap();

        let env = environment("ADD", "");
        let result = CalicoIpam::new(&store)
            .execute(Command::Add, &env, &ipam_config(json!({"type": "calico-ipam"})))
            .unwrap()
            .unwrap();
        assert_eq!(result.ip4.unwrap().ip, "10.0.0.2/32");
        assert_eq!(result.ip6, None);
        assert_eq!(
            store.handle_of("10.0.0.2".parse().unwrap()).as_deref(),
            Some("ff3afbd1-17ad-499d-b514-72438c009e81")
        );

        let err = CalicoIpam::new(&store)
            .execute(Command::Add, &env, &ipam_config(json!({"type": "calico-ipam"})))
            .unwrap_err();
        assert_eq!(err.to_string(), "No IPv4 addresses available in pool");
    }

    #[test]
    fn test_subnet_and_ipv6() {
        let store = store_with_pool("fd80:24e2:f998:72d6::/64");
        let env = environment("ADD", "K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx");
        let ipam = ipam_config(json!({
            "type": "calico-ipam",
            "subnet": "192.168.5.0/24",
            "assign_ipv6": "true"
        }));

        let result = CalicoIpam::new(&store).execute(Command::Add, &env, &ipam).unwrap().unwrap();
        assert_eq!(result.ip4.unwrap().ip, "192.168.5.1/32");
        assert_eq!(result.ip6.unwrap().ip, "fd80:24e2:f998:72d6::1/128");
        assert_eq!(
            store.handle_of("192.168.5.1".parse().unwrap()).as_deref(),
            Some("default.nginx")
        );
    }

    #[test]
    fn test_failed_ipv6_releases_ipv4() {
        let store = store_with_pool("10.0.0.0/24");
        let env = environment("ADD", "");
        let ipam = ipam_config(json!({"type": "calico-ipam", "assign_ipv6": true}));

        let err = CalicoIpam::new(&store).execute(Command::Add, &env, &ipam).unwrap_err();
        assert!(matches!(err, CalicoIpamError::Exhausted { version: 6 }));
        assert!(store.assignments().is_empty());
    }

    #[test]
    fn test_requested_address() {
        let store = store_with_pool("10.0.0.0/24");
        let ipam = ipam_config(json!({"type": "calico-ipam"}));
        let env = environment("ADD", "IP=10.0.0.99");

        let result = CalicoIpam::new(&store).execute(Command::Add, &env, &ipam).unwrap().unwrap();
        assert_eq!(result.ip4.unwrap().ip, "10.0.0.99/32");

        let err = CalicoIpam::new(&store).execute(Command::Add, &env, &ipam).unwrap_err();
        let err = CniError::from(err);
        assert_eq!(err.message, "Failed to assign IP address");
        assert_eq!(err.details.as_deref(), Some("10.0.0.99 is already assigned"));

        let env = environment("ADD", "IP=172.16.0.1");
        assert!(matches!(
            CalicoIpam::new(&store).execute(Command::Add, &env, &ipam),
            Err(CalicoIpamError::Assign { .. })
        ));
    }

    #[test]
    fn test_release_falls_back_to_container_id() {
        let store = store_with_pool("10.0.0.0/24");
        let container_id = "ff3afbd1-17ad-499d-b514-72438c009e81";
        store.claim_address("10.0.0.7".parse().unwrap(), container_id).unwrap();

        let env = environment("DEL", "K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx");
        let ipam = ipam_config(json!({"type": "calico-ipam"}));
        assert_eq!(CalicoIpam::new(&store).execute(Command::Del, &env, &ipam).unwrap(), None);
        assert!(store.assignments().is_empty());

        // Releasing again finds nothing, which is fine.
        assert_eq!(CalicoIpam::new(&store).execute(Command::Del, &env, &ipam).unwrap(), None);
    }

    #[test]
    fn test_standalone() {
        let store = store_with_pool("10.0.0.0/24");
        let config = json!({"name": "net1", "type": "calico", "ipam": {"type": "calico-ipam"}});

        let mut out = Vec::new();
        assert_eq!(run_standalone(&environment("ADD", ""), &config, &store, &mut out), 0);
        assert_eq!(
            serde_json::from_slice::<Value>(&out).unwrap(),
            json!({"ip4": {"ip": "10.0.0.1/32"}})
        );

        let mut out = Vec::new();
        assert_eq!(run_standalone(&environment("CHECK", ""), &config, &store, &mut out), 100);
        assert_eq!(
            serde_json::from_slice::<Value>(&out).unwrap(),
            json!({"code": 100, "msg": "Invalid arguments", "details": "invalid command 'CHECK'"})
        );
    }
}
