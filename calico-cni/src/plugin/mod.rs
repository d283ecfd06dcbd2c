//! The endpoint lifecycle: what `ADD` and `DEL` do, and how a half-finished `ADD` is undone.
//!
//! A container gets one endpoint, one veth and one set of addresses no matter how many Calico networks it joins.
//! Each network is a profile on that endpoint.

use std::env;
use std::io::Write;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::datastore::{Datastore, DatastoreError, Endpoint, WorkloadKey};
use crate::engine::ContainerEngine;
use crate::error::{report, Error};
use crate::ipam::{self, IpamInvoker};
use crate::network::cni::args::{Command, RequestContext, ORCHESTRATOR_CNI};
use crate::network::cni::schema::{IpamResult, ERR_CODE_GENERIC};
use crate::network::veth::VethManager;
use crate::policy::PolicyDriver;

pub mod fallback;

use self::fallback::try_keys;

/// One invocation of the plugin, with everything it talks to.
#[derive(derive_builder::Builder)]
#[builder(pattern = "owned")]
pub struct CniPlugin<'a> {
    /// Network configuration as received, handed to IPAM unchanged.
    config: &'a Value,

    ctx: &'a RequestContext,

    /// Host to register endpoints under.
    #[builder(setter(into))]
    hostname: String,

    datastore: &'a dyn Datastore,
    ipam: &'a dyn IpamInvoker,
    policy: &'a dyn PolicyDriver,
    veth: &'a dyn VethManager,
    engine: &'a dyn ContainerEngine,
}

impl CniPlugin<'_> {
    /// Runs the command, writing the result or error for the runtime to `out`. Returns the exit code.
    pub fn execute<W: Write>(&self, mut out: W) -> i32 {
        let outcome = match self.ctx.command {
            Command::Add => self.add(),
            Command::Del => self.delete().map(|()| None),
        };

        match outcome {
            Ok(Some(result)) => {
                let dump = serde_json::to_string(&result).expect("IPAM results are always serializable");
                debug!("Printing CNI result to stdout: {}", dump);
                if let Err(err) = writeln!(out, "{}", dump).and_then(|_| out.flush()) {
                    error!("Could not write result: {}", err);
                    return ERR_CODE_GENERIC as i32;
                }
                0
            }
            Ok(None) => 0,
            Err(err) => report(err, out),
        }
    }

    fn add(&self) -> Result<Option<IpamResult>, Error> {
        // Only Docker under Kubernetes calls plugins for host-networked containers.
        if self.engine.uses_host_networking(&self.ctx.container_id)? {
            info!(
                "Cannot network container {} since it is configured with host networking.",
                self.ctx.container_id
            );
            return Ok(None);
        }

        info!(
            "Configuring network '{}' for container: {}",
            self.ctx.network_name, self.ctx.container_id
        );

        debug!("Checking for existing Calico endpoint");
        let result = match self.get_endpoint()? {
            None => {
                info!("No endpoint exists for workload - creating");
                self.add_new_endpoint()?
            }
            Some(endpoint) if self.ctx.running_under_k8s() => {
                // Kubernetes only supports one network per pod, so an existing endpoint belongs to a pod that has
                // since been destroyed.
                info!("Kubernetes pod has been recreated");
                self.remove_stale_endpoint(&endpoint);
                self.release_ips();
                if let Err(err) = self.policy.remove_profile() {
                    warn!("Could not remove profile of stale endpoint: {}", err);
                }
                self.add_new_endpoint()?
            }
            Some(endpoint) => {
                info!("Endpoint for container exists - add to new network");
                self.add_existing_endpoint(endpoint)?
            }
        };

        info!("Finished networking container: {}", self.ctx.container_id);
        Ok(Some(result))
    }

    fn add_new_endpoint(&self) -> Result<IpamResult, Error> {
        info!("Configuring a new Endpoint");
        let allocation = ipam::assign(self.ipam, &self.ctx.ipam_env_for(Command::Add), self.config)?;
        let networks = allocation.networks();

        debug!("Creating Calico endpoint with workload_id={}", self.ctx.workload_id());
        let mut endpoint = match self.datastore.create_endpoint(&self.workload_key(), &networks) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                error!("Failed to create Calico endpoint: {}", err);
                self.release_ips();
                return Err(Error::datastore("Failed to create Calico endpoint", err));
            }
        };
        debug!("Setting Labels: {:?}", self.ctx.labels);
        endpoint.labels = self.ctx.labels.clone();
        info!("Created Calico endpoint with IP address(es) {:?}", networks);

        self.provision_veth(&mut endpoint)?;

        if let Err(err) = self.policy.apply_profile(&mut endpoint) {
            error!("Failed to apply profile to endpoint {}", endpoint.name);
            self.remove_veth(&endpoint);
            self.remove_workload();
            self.release_ips();
            return Err(err.into());
        }

        Ok(allocation.result.with_placeholders())
    }

    /// Another network for a container that is already set up: only its profile changes.
    fn add_existing_endpoint(&self, mut endpoint: Endpoint) -> Result<IpamResult, Error> {
        let ipv4 = endpoint.ipv4();
        if ipv4.is_none() {
            warn!("No IPV4 address attached to existing endpoint");
        }
        let ipv6 = endpoint.ipv6();
        if ipv6.is_none() {
            warn!("No IPV6 address attached to existing endpoint");
        }

        // Nothing was set up, so there is nothing to undo.
        self.policy.apply_profile(&mut endpoint).map_err(|err| {
            error!("Failed to apply profile to endpoint {}", endpoint.name);
            err
        })?;

        Ok(IpamResult::from_networks(ipv4, ipv6))
    }

    fn delete(&self) -> Result<(), Error> {
        info!(
            "Remove network '{}' from container: {}",
            self.ctx.network_name, self.ctx.container_id
        );

        self.release_ips();

        let endpoint = match self.get_endpoint()? {
            Some(endpoint) => endpoint,
            None => {
                warn!("No Calico Endpoint for workload: {}", self.ctx.workload_id());
                return Ok(());
            }
        };

        self.remove_veth(&endpoint);
        self.remove_workload();
        if let Err(err) = self.policy.remove_profile() {
            error!("Failed to remove profile {}: {}", self.policy.profile_name(), err);
        }

        info!("Finished removing container: {}", self.ctx.container_id);
        Ok(())
    }

    /// Where this workload's endpoint lives.
    fn workload_key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.hostname, self.ctx.orchestrator_id(), self.ctx.workload_id())
    }

    /// Where releases before Kubernetes workload IDs put it.
    fn legacy_key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.hostname, ORCHESTRATOR_CNI, &self.ctx.container_id)
    }

    fn get_endpoint(&self) -> Result<Option<Endpoint>, Error> {
        debug!("Looking for endpoint that matches workload ID {}", self.ctx.workload_id());
        match try_keys(&self.workload_key(), &self.legacy_key(), |key| self.datastore.get_endpoint(key)) {
            Ok(endpoint) => Ok(Some(endpoint)),
            Err(err) if err.is_absent() => {
                debug!("No endpoint found matching container ID {}", self.ctx.container_id);
                Ok(None)
            }
            Err(err @ DatastoreError::MultipleEndpointsMatch(_)) => Err(Error::datastore(
                format!("Multiple Endpoints found matching ID {}", self.ctx.workload_id()),
                err,
            )),
            Err(err) => Err(Error::datastore("Failed to look up endpoint", err)),
        }
    }

    fn provision_veth(&self, endpoint: &mut Endpoint) -> Result<(), Error> {
        debug!("Provisioning Calico veth interface");
        let netns = absolute(&self.ctx.netns);
        debug!("netns path: {}", netns.display());

        match self.veth.provision_veth(endpoint, &netns, &self.ctx.interface) {
            Ok(mac) => endpoint.mac = Some(mac),
            Err(error) => {
                error!("Failed to provision veth interface for endpoint {}: {}", endpoint.name, error);
                self.remove_workload();
                self.release_ips();
                return Err(Error::Netns {
                    context: format!("Failed to provision veth interface for endpoint {}", endpoint.name),
                    error,
                });
            }
        }
        debug!("Endpoint has mac address: {:?}", endpoint.mac);

        if let Err(err) = self.datastore.set_endpoint(endpoint) {
            error!("Failed to save endpoint {}: {}", endpoint.name, err);
            self.remove_veth(endpoint);
            self.remove_workload();
            self.release_ips();
            return Err(Error::datastore("Failed to save Calico endpoint", err));
        }
        info!("Provisioned {} in netns {}", self.ctx.interface, netns.display());
        Ok(())
    }

    /// Drops an endpoint left behind by a previous pod. Its addresses are released separately, through IPAM.
    fn remove_stale_endpoint(&self, endpoint: &Endpoint) {
        info!("Removing stale Calico endpoint '{}'", endpoint.endpoint_id);
        if let Err(err) = self.datastore.remove_endpoint(endpoint) {
            info!("Error removing stale endpoint, ignoring: {}", err);
        }
    }

    fn remove_workload(&self) {
        info!("Removing Calico workload '{}'", self.ctx.workload_id());
        match try_keys(&self.workload_key(), &self.legacy_key(), |key| self.datastore.remove_workload(key)) {
            Ok(()) => (),
            Err(err) if err.is_absent() => {
                warn!("Could not find workload with container ID {}.", self.ctx.container_id)
            }
            Err(err) => error!("Failed to remove workload {}: {}", self.ctx.workload_id(), err),
        }
    }

    fn remove_veth(&self, endpoint: &Endpoint) {
        info!("Removing veth for endpoint: {}", endpoint.name);
        match self.veth.remove_veth(&endpoint.name) {
            Ok(removed) => debug!("Successfully removed endpoint {}? {}", endpoint.name, removed),
            Err(err) => warn!("Unable to remove veth {}: {}", endpoint.name, err),
        }
    }

    fn release_ips(&self) {
        ipam::release(self.ipam, &self.ctx.ipam_env_for(Command::Del), self.config);
    }
}

/// `CNI_NETNS` may be relative to the directory the runtime started us in.
fn absolute(path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        return path.into();
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.into(),
    }
}
