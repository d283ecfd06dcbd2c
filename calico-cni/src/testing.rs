//! In-memory stand-ins for the plugin's collaborators.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use serde_json::Value;

use crate::datastore::{Datastore, DatastoreError, Endpoint, IpamStore, Rules, WorkloadKey};
use crate::engine::{ContainerEngine, EngineError};
use crate::ipam::{IpamError, IpamInvoker, IpamOutput};
use crate::kubernetes::{KubernetesError, Pod, PodSource};
use crate::network::cni::args::{Command, Environment};
use crate::network::namespace::NetnsError;
use crate::network::veth::VethManager;
use crate::policy::{PolicyDriver, PolicyError};

#[derive(Default)]
struct State {
    endpoints: BTreeMap<WorkloadKey, Vec<Endpoint>>,
    profiles: BTreeMap<String, (Rules, BTreeSet<String>)>,
    pools: Vec<IpNetwork>,
    assignments: BTreeMap<IpAddr, String>,
    next_id: u64,
    revision: u64,
}

/// [`Datastore`] and [`IpamStore`] over plain maps, recording which operations were called.
#[derive(Default)]
pub struct MemoryStore {
    state: RefCell<State>,
    calls: RefCell<Vec<&'static str>>,
    failing: RefCell<BTreeSet<&'static str>>,
}

impl MemoryStore {
    /// Makes every later call to `operation` fail with a server error.
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.borrow_mut().insert(operation);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        self.calls.borrow().iter().filter(|call| **call == operation).count()
    }

    /// Stores an endpoint as-is, even next to another one for the same workload.
    pub fn insert_endpoint(&self, mut endpoint: Endpoint) -> Endpoint {
        let mut state = self.state.borrow_mut();
        state.revision += 1;
        endpoint.revision = Some(state.revision);
        let key = endpoint.workload.clone().expect("endpoint without a workload");
        state.endpoints.entry(key).or_default().push(endpoint.clone());
        endpoint
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.borrow().endpoints.values().flatten().cloned().collect()
    }

    pub fn profile(&self, name: &str) -> Option<(Rules, BTreeSet<String>)> {
        self.state.borrow().profiles.get(name).cloned()
    }

    pub fn add_pool(&self, pool: IpNetwork) {
        self.state.borrow_mut().pools.push(pool);
    }

    pub fn handle_of(&self, address: IpAddr) -> Option<String> {
        self.state.borrow().assignments.get(&address).cloned()
    }

    pub fn assignments(&self) -> BTreeMap<IpAddr, String> {
        self.state.borrow().assignments.clone()
    }

    fn record(&self, operation: &'static str) -> Result<(), DatastoreError> {
        self.calls.borrow_mut().push(operation);
        if self.failing.borrow().contains(operation) {
            Err(DatastoreError::Server {
                code: 300,
                message: format!("{} failed", operation),
            })
        } else {
            Ok(())
        }
    }

    fn write(&self, endpoint: &mut Endpoint, check_revision: bool) -> Result<(), DatastoreError> {
        let key = endpoint
            .workload
            .clone()
            .ok_or_else(|| DatastoreError::NotFound(format!("workload of endpoint {}", endpoint.endpoint_id)))?;
        let mut state = self.state.borrow_mut();
        state.revision += 1;
        let revision = state.revision;

        let position = state
            .endpoints
            .get(&key)
            .and_then(|endpoints| endpoints.iter().position(|e| e.endpoint_id == endpoint.endpoint_id));
        match position {
            Some(position) => {
                let stored = &mut state.endpoints.get_mut(&key).unwrap()[position];
                if check_revision && endpoint.revision.is_some() && stored.revision != endpoint.revision {
                    return Err(DatastoreError::Conflict(format!("endpoint {}", endpoint.endpoint_id)));
                }
                endpoint.revision = Some(revision);
                *stored = endpoint.clone();
            }
            None if check_revision => return Err(DatastoreError::NotFound(format!("endpoint {}", endpoint.endpoint_id))),
            None => {
                endpoint.revision = Some(revision);
                state.endpoints.entry(key).or_default().push(endpoint.clone());
            }
        }
        Ok(())
    }
}

impl Datastore for MemoryStore {
    fn get_endpoint(&self, key: &WorkloadKey) -> Result<Endpoint, DatastoreError> {
        self.record("get_endpoint")?;
        let state = self.state.borrow();
        match state.endpoints.get(key).map(Vec::as_slice).unwrap_or_default() {
            [] => Err(DatastoreError::NotFound(format!("endpoint for workload {}", key.workload_id))),
            [endpoint] => Ok(endpoint.clone()),
            _ => Err(DatastoreError::MultipleEndpointsMatch(key.workload_id.clone())),
        }
    }

    fn create_endpoint(&self, key: &WorkloadKey, nets: &[IpNetwork]) -> Result<Endpoint, DatastoreError> {
        self.record("create_endpoint")?;
        let id = {
            let mut state = self.state.borrow_mut();
            state.next_id += 1;
            format!("{:032x}", state.next_id)
        };
        Ok(self.insert_endpoint(Endpoint::new(key.clone(), id, nets)))
    }

    fn set_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), DatastoreError> {
        self.record("set_endpoint")?;
        self.write(endpoint, false)
    }

    fn update_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), DatastoreError> {
        self.record("update_endpoint")?;
        self.write(endpoint, true)
    }

    fn remove_endpoint(&self, endpoint: &Endpoint) -> Result<(), DatastoreError> {
        self.record("remove_endpoint")?;
        let mut state = self.state.borrow_mut();
        let endpoints = endpoint
            .workload
            .as_ref()
            .and_then(|key| state.endpoints.get_mut(key))
            .ok_or_else(|| DatastoreError::NotFound(format!("endpoint {}", endpoint.endpoint_id)))?;
        let before = endpoints.len();
        endpoints.retain(|e| e.endpoint_id != endpoint.endpoint_id);
        if endpoints.len() == before {
            return Err(DatastoreError::NotFound(format!("endpoint {}", endpoint.endpoint_id)));
        }
        state.endpoints.retain(|_, endpoints| !endpoints.is_empty());
        Ok(())
    }

    fn remove_workload(&self, key: &WorkloadKey) -> Result<(), DatastoreError> {
        self.record("remove_workload")?;
        match self.state.borrow_mut().endpoints.remove(key) {
            Some(_) => Ok(()),
            None => Err(DatastoreError::NotFound(format!("workload {}", key.workload_id))),
        }
    }

    fn profile_exists(&self, name: &str) -> Result<bool, DatastoreError> {
        self.record("profile_exists")?;
        Ok(self.state.borrow().profiles.contains_key(name))
    }

    fn create_profile(&self, name: &str, rules: Option<&Rules>, tags: &BTreeSet<String>) -> Result<(), DatastoreError> {
        self.record("create_profile")?;
        let rules = rules.cloned().unwrap_or_else(|| Rules::default_for(name));
        self.state.borrow_mut().profiles.insert(name.into(), (rules, tags.clone()));
        Ok(())
    }

    fn remove_profile(&self, name: &str) -> Result<(), DatastoreError> {
        self.record("remove_profile")?;
        match self.state.borrow_mut().profiles.remove(name) {
            Some(_) => Ok(()),
            None => Err(DatastoreError::NotFound(format!("profile {}", name))),
        }
    }

    fn get_profile_members(&self, name: &str) -> Result<Vec<Endpoint>, DatastoreError> {
        self.record("get_profile_members")?;
        Ok(self
            .endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.profile_ids.iter().any(|p| p == name))
            .collect())
    }

    fn append_profiles_to_endpoint(&self, endpoint: &mut Endpoint, profile_names: &[String]) -> Result<(), DatastoreError> {
        self.record("append_profiles_to_endpoint")?;
        let mut updated = endpoint.clone();
        for name in profile_names {
            if !updated.profile_ids.contains(name) {
                updated.profile_ids.push(name.clone());
            }
        }
        if updated.profile_ids == endpoint.profile_ids {
            return Ok(());
        }
        self.write(&mut updated, true)?;
        *endpoint = updated;
        Ok(())
    }
}

impl IpamStore for MemoryStore {
    fn ip_pools(&self, version: u8) -> Result<Vec<IpNetwork>, DatastoreError> {
        self.record("ip_pools")?;
        Ok(self
            .state
            .borrow()
            .pools
            .iter()
            .filter(|pool| match pool {
                IpNetwork::V4(_) => version == 4,
                IpNetwork::V6(_) => version == 6,
            })
            .copied()
            .collect())
    }

    fn assigned_addresses(&self, pool: &IpNetwork) -> Result<BTreeSet<IpAddr>, DatastoreError> {
        self.record("assigned_addresses")?;
        Ok(self
            .state
            .borrow()
            .assignments
            .keys()
            .filter(|address| pool.contains(**address))
            .copied()
            .collect())
    }

    fn claim_address(&self, address: IpAddr, handle: &str) -> Result<(), DatastoreError> {
        self.record("claim_address")?;
        let mut state = self.state.borrow_mut();
        if state.assignments.contains_key(&address) {
            return Err(DatastoreError::AlreadyExists(address.to_string()));
        }
        state.assignments.insert(address, handle.into());
        Ok(())
    }

    fn release_by_handle(&self, handle: &str) -> Result<Vec<IpAddr>, DatastoreError> {
        self.record("release_by_handle")?;
        let mut state = self.state.borrow_mut();
        let released: Vec<IpAddr> = state
            .assignments
            .iter()
            .filter(|(_, owner)| *owner == handle)
            .map(|(address, _)| *address)
            .collect();
        if released.is_empty() {
            return Err(DatastoreError::NotFound(format!("handle {}", handle)));
        }
        for address in &released {
            state.assignments.remove(address);
        }
        Ok(released)
    }
}

/// IPAM plugin that answers every command with canned output.
pub struct ScriptedIpam {
    add: IpamOutput,
    del: IpamOutput,
    commands: RefCell<Vec<Command>>,
    environments: RefCell<Vec<Environment>>,
}

impl ScriptedIpam {
    /// Succeeds, assigning whatever `result` holds.
    pub fn assigning(result: Value) -> ScriptedIpam {
        ScriptedIpam::new(
            IpamOutput {
                code: 0,
                output: result.to_string(),
            },
            IpamOutput {
                code: 0,
                output: String::new(),
            },
        )
    }

    /// Answers both `ADD` and `DEL` with `output`.
    pub fn failing(output: IpamOutput) -> ScriptedIpam {
        ScriptedIpam::new(output.clone(), output)
    }

    fn new(add: IpamOutput, del: IpamOutput) -> ScriptedIpam {
        ScriptedIpam {
            add,
            del,
            commands: RefCell::default(),
            environments: RefCell::default(),
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub fn environments(&self) -> Vec<Environment> {
        self.environments.borrow().clone()
    }
}

impl IpamInvoker for ScriptedIpam {
    fn invoke(&self, command: Command, env: &Environment, _config: &Value) -> Result<IpamOutput, IpamError> {
        self.commands.borrow_mut().push(command);
        self.environments.borrow_mut().push(env.clone());
        Ok(match command {
            Command::Add => self.add.clone(),
            Command::Del => self.del.clone(),
        })
    }
}

pub const FAKE_MAC: &str = "ee:ee:ee:ee:ee:ee";

/// Records veth operations; provisioning fails when `fail` is set.
#[derive(Default)]
pub struct RecordingVeth {
    pub fail: bool,
    pub provisioned: RefCell<Vec<String>>,
    pub removed: RefCell<Vec<String>>,
}

impl RecordingVeth {
    pub fn failing() -> RecordingVeth {
        RecordingVeth {
            fail: true,
            ..RecordingVeth::default()
        }
    }
}

impl VethManager for RecordingVeth {
    fn provision_veth(&self, endpoint: &Endpoint, _netns: &Path, _ifname: &str) -> Result<String, NetnsError> {
        self.provisioned.borrow_mut().push(endpoint.name.clone());
        if self.fail {
            return Err(NetnsError::Command {
                command: format!("ip link add {}", endpoint.name),
                status: "exited with code 2".into(),
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        Ok(FAKE_MAC.into())
    }

    fn remove_veth(&self, name: &str) -> Result<bool, NetnsError> {
        self.removed.borrow_mut().push(name.into());
        Ok(true)
    }
}

pub struct FakeEngine {
    pub host_networking: bool,
}

impl ContainerEngine for FakeEngine {
    fn uses_host_networking(&self, _container_id: &str) -> Result<bool, EngineError> {
        Ok(self.host_networking)
    }
}

/// Policy driver that attaches its profile name without touching the datastore.
pub struct RecordingPolicy {
    pub name: String,
    pub fail: bool,
    pub applied: Cell<usize>,
    pub removed: Cell<usize>,
}

impl RecordingPolicy {
    pub fn new(name: &str) -> RecordingPolicy {
        RecordingPolicy {
            name: name.into(),
            fail: false,
            applied: Cell::new(0),
            removed: Cell::new(0),
        }
    }

    pub fn failing(name: &str) -> RecordingPolicy {
        RecordingPolicy {
            fail: true,
            ..RecordingPolicy::new(name)
        }
    }
}

impl PolicyDriver for RecordingPolicy {
    fn profile_name(&self) -> &str {
        &self.name
    }

    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError> {
        self.applied.set(self.applied.get() + 1);
        if self.fail {
            return Err(PolicyError::apply_with_details("Failed to apply profile", "injected"));
        }
        if !endpoint.profile_ids.contains(&self.name) {
            endpoint.profile_ids.push(self.name.clone());
        }
        Ok(())
    }

    fn remove_profile(&self) -> Result<(), PolicyError> {
        self.removed.set(self.removed.get() + 1);
        Ok(())
    }
}

/// Serves one pod, or none at all.
pub struct FakePods(Option<Pod>);

impl FakePods {
    pub fn with(pod: Pod) -> FakePods {
        FakePods(Some(pod))
    }

    pub fn missing() -> FakePods {
        FakePods(None)
    }
}

impl PodSource for FakePods {
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubernetesError> {
        self.0.clone().ok_or_else(|| KubernetesError::Status {
            status: 404,
            url: format!("namespaces/{}/pods/{}", namespace, name),
        })
    }
}
