//! The Calico datastore: endpoints, profiles and IPAM assignments.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub mod etcd;

/// Prefix of the host-side veth name for every endpoint.
pub const IF_PREFIX: &str = "cali";

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("multiple endpoints match workload {0}")]
    MultipleEndpointsMatch(String),

    /// A compare-and-swap write lost the race with another writer.
    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("datastore request failed: {context}")]
    Transport {
        context: String,
        #[source]
        error: reqwest::Error,
    },

    #[error("datastore returned error {code}: {message}")]
    Server { code: u64, message: String },

    #[error("invalid datastore record at {key}")]
    InvalidJson {
        key: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("invalid datastore configuration: {0}")]
    Config(String),
}

impl DatastoreError {
    /// Whether the error means the record isn't there (any more). Concurrent modification counts, since the
    /// record we looked for is no longer the one in the store.
    pub fn is_absent(&self) -> bool {
        matches!(self, DatastoreError::NotFound(_) | DatastoreError::Conflict(_))
    }
}

/// Identifies the workload an endpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub hostname: String,
    pub orchestrator_id: String,
    pub workload_id: String,
}

impl WorkloadKey {
    pub fn new<H: Into<String>, O: Into<String>, W: Into<String>>(hostname: H, orchestrator_id: O, workload_id: W) -> WorkloadKey {
        WorkloadKey {
            hostname: hostname.into(),
            orchestrator_id: orchestrator_id.into(),
            workload_id: workload_id.into(),
        }
    }
}

/// One container's attachment to the Calico network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(skip)]
    pub workload: Option<WorkloadKey>,

    #[serde(skip)]
    pub endpoint_id: String,

    /// Store revision this copy was read at, for compare-and-swap updates.
    #[serde(skip)]
    pub revision: Option<u64>,

    pub state: String,

    /// Host-side interface name.
    pub name: String,

    #[serde(default)]
    pub mac: Option<String>,

    #[serde(default)]
    pub profile_ids: Vec<String>,

    #[serde(default)]
    pub ipv4_nets: BTreeSet<Ipv4Network>,

    #[serde(default)]
    pub ipv6_nets: BTreeSet<Ipv6Network>,

    #[serde(default)]
    pub ipv4_gateway: Option<IpAddr>,

    #[serde(default)]
    pub ipv6_gateway: Option<IpAddr>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Endpoint {
    /// A new active endpoint with one host address per given network.
    pub fn new<S: Into<String>>(workload: WorkloadKey, endpoint_id: S, nets: &[IpNetwork]) -> Endpoint {
        let endpoint_id = endpoint_id.into();
        let mut endpoint = Endpoint {
            workload: Some(workload),
            name: interface_name(&endpoint_id),
            endpoint_id,
            revision: None,
            state: "active".into(),
            mac: None,
            profile_ids: Vec::new(),
            ipv4_nets: BTreeSet::new(),
            ipv6_nets: BTreeSet::new(),
            ipv4_gateway: None,
            ipv6_gateway: None,
            labels: BTreeMap::new(),
        };
        for net in nets {
            match net.ip() {
                IpAddr::V4(addr) => {
                    endpoint.ipv4_nets.insert(Ipv4Network::from(addr));
                }
                IpAddr::V6(addr) => {
                    endpoint.ipv6_nets.insert(Ipv6Network::from(addr));
                }
            }
        }
        endpoint
    }

    pub fn ipv4(&self) -> Option<Ipv4Network> {
        self.ipv4_nets.iter().next().copied()
    }

    pub fn ipv6(&self) -> Option<Ipv6Network> {
        self.ipv6_nets.iter().next().copied()
    }

    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4_nets
            .iter()
            .map(|net| IpAddr::V4(net.ip()))
            .chain(self.ipv6_nets.iter().map(|net| IpAddr::V6(net.ip())))
    }
}

/// Host-side veth name for an endpoint: `cali` plus the first 11 characters of its ID, to fit in IFNAMSIZ.
pub fn interface_name(endpoint_id: &str) -> String {
    let suffix: String = endpoint_id.chars().take(11).collect();
    format!("{}{}", IF_PREFIX, suffix)
}

/// A Calico policy rule. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_net: Option<IpNetwork>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_ports: Vec<PortRange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dst_ports: Vec<PortRange>,
}

impl Rule {
    pub fn allow() -> Rule {
        Rule {
            action: "allow".into(),
            ..Rule::default()
        }
    }

    pub fn allow_from_tag<S: Into<String>>(tag: S) -> Rule {
        Rule {
            src_tag: Some(tag.into()),
            ..Rule::allow()
        }
    }
}

/// A port or inclusive port range, stored as `80` or `"8000:8080"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortRange {
    Single(u16),
    Range(u16, u16),
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PortRange::Single(port) => write!(f, "{}", port),
            PortRange::Range(lo, hi) => write!(f, "{}:{}", lo, hi),
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<PortRange, String> {
        let parse = |p: &str| p.trim().parse::<u16>().map_err(|_| format!("invalid port {:?}", p));
        match s.split_once(':') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("invalid port range {:?}", s));
                }
                Ok(PortRange::Range(lo, hi))
            }
            None => Ok(PortRange::Single(parse(s)?)),
        }
    }
}

impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PortRange::Single(port) => serializer.serialize_u16(*port),
            range => serializer.collect_str(range),
        }
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<PortRange, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(port) => Ok(PortRange::Single(port)),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// Inbound and outbound rules of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    pub id: String,
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}

impl Rules {
    /// Allow everything in both directions.
    pub fn allow_all<S: Into<String>>(id: S) -> Rules {
        Rules {
            id: id.into(),
            inbound_rules: vec![Rule::allow()],
            outbound_rules: vec![Rule::allow()],
        }
    }

    /// What a profile gets when created without explicit rules: inbound only from members of the profile's own
    /// tag, any outbound.
    pub fn default_for<S: Into<String>>(profile_name: S) -> Rules {
        let id = profile_name.into();
        Rules {
            inbound_rules: vec![Rule::allow_from_tag(id.clone())],
            outbound_rules: vec![Rule::allow()],
            id,
        }
    }
}

/// Endpoint and profile operations.
pub trait Datastore {
    /// Errors with [`DatastoreError::NotFound`] when the workload has no endpoint, and
    /// [`DatastoreError::MultipleEndpointsMatch`] when it has more than one.
    fn get_endpoint(&self, key: &WorkloadKey) -> Result<Endpoint, DatastoreError>;

    /// Creates and stores a new endpoint for the workload with the given addresses.
    fn create_endpoint(&self, key: &WorkloadKey, nets: &[IpNetwork]) -> Result<Endpoint, DatastoreError>;

    /// Unconditionally writes the endpoint.
    fn set_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), DatastoreError>;

    /// Writes the endpoint only if it has not changed since it was read.
    fn update_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), DatastoreError>;

    fn remove_endpoint(&self, endpoint: &Endpoint) -> Result<(), DatastoreError>;

    /// Removes the workload and every endpoint under it.
    fn remove_workload(&self, key: &WorkloadKey) -> Result<(), DatastoreError>;

    fn profile_exists(&self, name: &str) -> Result<bool, DatastoreError>;

    /// Creates (or overwrites) a profile. `None` rules means [`Rules::default_for`].
    fn create_profile(&self, name: &str, rules: Option<&Rules>, tags: &BTreeSet<String>) -> Result<(), DatastoreError>;

    fn remove_profile(&self, name: &str) -> Result<(), DatastoreError>;

    /// Endpoints that reference the profile.
    fn get_profile_members(&self, name: &str) -> Result<Vec<Endpoint>, DatastoreError>;

    /// Adds the profiles the endpoint doesn't already have, retrying on concurrent modification.
    fn append_profiles_to_endpoint(&self, endpoint: &mut Endpoint, profile_names: &[String]) -> Result<(), DatastoreError>;
}

/// Address assignment records used by `calico-ipam`.
pub trait IpamStore {
    /// Configured pools for the address family of `version` (4 or 6).
    fn ip_pools(&self, version: u8) -> Result<Vec<IpNetwork>, DatastoreError>;

    /// Addresses already assigned within a pool.
    fn assigned_addresses(&self, pool: &IpNetwork) -> Result<BTreeSet<IpAddr>, DatastoreError>;

    /// Atomically claims an address for a handle. Fails with [`DatastoreError::AlreadyExists`] if it is taken.
    fn claim_address(&self, address: IpAddr, handle: &str) -> Result<(), DatastoreError>;

    /// Releases every address held by a handle. Fails with [`DatastoreError::NotFound`] if it held none.
    fn release_by_handle(&self, handle: &str) -> Result<Vec<IpAddr>, DatastoreError>;
}
