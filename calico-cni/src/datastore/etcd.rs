//! [`Datastore`] and [`IpamStore`] backed by the etcd v2 keys API.
//!
//! Key layout:
//!
//! ```text
//! /calico/v1/host/<host>/workload/<orchestrator>/<workload>/endpoint/<endpoint id>
//! /calico/v1/policy/profile/<name>/{rules,tags}
//! /calico/v1/ipam/v<4|6>/pool/<cidr>
//! /calico/ipam/v2/assignment/<address>  -> handle
//! /calico/ipam/v2/handle/<handle>/<address>
//! ```

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::{fs, thread, time::Duration};

use ipnetwork::IpNetwork;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Certificate, Identity, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Datastore, DatastoreError, Endpoint, IpamStore, Rules, WorkloadKey};
use crate::network::cni::args::Environment;
use crate::network::cni::schema::NetworkConfiguration;

const DEFAULT_ETCD_AUTHORITY: &str = "127.0.0.1:2379";
const DEFAULT_ETCD_SCHEME: &str = "http";

pub const ETCD_AUTHORITY_ENV: &str = "ETCD_AUTHORITY";
pub const ETCD_ENDPOINTS_ENV: &str = "ETCD_ENDPOINTS";
const ETCD_SCHEME_ENV: &str = "ETCD_SCHEME";
const ETCD_KEY_FILE_ENV: &str = "ETCD_KEY_FILE";
const ETCD_CERT_FILE_ENV: &str = "ETCD_CERT_FILE";
const ETCD_CA_CERT_FILE_ENV: &str = "ETCD_CA_CERT_FILE";

const HOST_DIR: &str = "/calico/v1/host";
const PROFILE_DIR: &str = "/calico/v1/policy/profile";
const ASSIGNMENT_DIR: &str = "/calico/ipam/v2/assignment";
const HANDLE_DIR: &str = "/calico/ipam/v2/handle";

/// How many times a read-modify-write is retried after losing a compare-and-swap.
const CAS_RETRIES: usize = 5;

// etcd v2 error codes
const ETCD_KEY_NOT_FOUND: u64 = 100;
const ETCD_COMPARE_FAILED: u64 = 101;
const ETCD_NODE_EXISTS: u64 = 105;

/// Where and how to reach etcd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    /// Base URLs, tried in order.
    pub endpoints: Vec<String>,
    pub key_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
}

impl EtcdConfig {
    /// Network configuration settings win over the `ETCD_*` environment variables.
    pub fn new(config: &NetworkConfiguration, env: &Environment) -> Result<EtcdConfig, DatastoreError> {
        let from_env = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();

        let endpoints = match config.etcd_endpoints.clone().or_else(|| from_env(ETCD_ENDPOINTS_ENV)) {
            Some(endpoints) => endpoints
                .split(',')
                .map(|e| e.trim().trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty())
                .collect::<Vec<_>>(),
            None => {
                let authority = config
                    .etcd_authority
                    .clone()
                    .or_else(|| from_env(ETCD_AUTHORITY_ENV))
                    .unwrap_or_else(|| DEFAULT_ETCD_AUTHORITY.into());
                let scheme = config
                    .etcd_scheme
                    .clone()
                    .or_else(|| from_env(ETCD_SCHEME_ENV))
                    .unwrap_or_else(|| DEFAULT_ETCD_SCHEME.into());
                vec![format!("{}://{}", scheme, authority)]
            }
        };

        if endpoints.is_empty() {
            return Err(DatastoreError::Config("no etcd endpoints configured".into()));
        }
        if let Some(bad) = endpoints
            .iter()
            .find(|e| !(e.starts_with("http://") || e.starts_with("https://")))
        {
            return Err(DatastoreError::Config(format!("invalid etcd endpoint {}", bad)));
        }

        Ok(EtcdConfig {
            endpoints,
            key_file: config.etcd_key_file.clone().or_else(|| from_env(ETCD_KEY_FILE_ENV).map(PathBuf::from)),
            cert_file: config.etcd_cert_file.clone().or_else(|| from_env(ETCD_CERT_FILE_ENV).map(PathBuf::from)),
            ca_cert_file: config
                .etcd_ca_cert_file
                .clone()
                .or_else(|| from_env(ETCD_CA_CERT_FILE_ENV).map(PathBuf::from)),
        })
    }
}

/// etcd node, as returned by the keys API.
#[derive(Debug, Deserialize)]
struct Node {
    key: String,

    #[serde(default)]
    value: Option<String>,

    #[serde(default)]
    dir: bool,

    #[serde(default)]
    nodes: Vec<Node>,

    #[serde(rename = "modifiedIndex")]
    #[serde(default)]
    modified_index: u64,
}

impl Node {
    /// All value-bearing nodes under this one.
    fn leaves(&self) -> Vec<&Node> {
        if !self.dir {
            return vec![self];
        }
        self.nodes.iter().flat_map(Node::leaves).collect()
    }

    fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    node: Node,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorCode")]
    error_code: u64,

    #[serde(default)]
    message: String,

    #[serde(default)]
    cause: Option<String>,
}

/// Precondition on a write.
#[derive(Debug, Copy, Clone)]
enum Condition {
    None,
    PrevExist(bool),
    PrevIndex(u64),
}

#[derive(Debug, Deserialize)]
struct PoolRecord {
    cidr: IpNetwork,
}

pub struct EtcdClient {
    endpoints: Vec<String>,
    http: Client,
}

impl EtcdClient {
    pub fn new(config: &EtcdConfig) -> Result<EtcdClient, DatastoreError> {
        let mut builder = Client::builder();

        if let Some(ca) = &config.ca_cert_file {
            let pem = read_file(ca)?;
            let cert = Certificate::from_pem(&pem).map_err(|error| DatastoreError::Transport {
                context: format!("invalid CA certificate {}", ca.display()),
                error,
            })?;
            builder = builder.add_root_certificate(cert);
        }

        match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                let mut pem = read_file(cert)?;
                pem.extend(read_file(key)?);
                let identity = Identity::from_pem(&pem).map_err(|error| DatastoreError::Transport {
                    context: format!("invalid client certificate {}", cert.display()),
                    error,
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => (),
            _ => {
                return Err(DatastoreError::Config(
                    "etcd client certificate and key must be configured together".into(),
                ))
            }
        }

        let http = builder.build().map_err(|error| DatastoreError::Transport {
            context: "could not build etcd client".into(),
            error,
        })?;

        Ok(EtcdClient {
            endpoints: config.endpoints.clone(),
            http,
        })
    }

    /// Sends a request to each endpoint in turn until one answers.
    fn send<F>(&self, key: &str, build: F) -> Result<Response, DatastoreError>
    where
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let url = format!("{}/v2/keys{}", endpoint, key);
            match build(&self.http, url).send() {
                Ok(response) => return Ok(response),
                Err(error) => {
                    warn!("etcd endpoint {} failed: {}", endpoint, error);
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(DatastoreError::Transport {
                context: format!("no etcd endpoint reachable for {}", key),
                error,
            }),
            None => Err(DatastoreError::Config("no etcd endpoints configured".into())),
        }
    }

    fn read(&self, key: &str, recursive: bool) -> Result<Node, DatastoreError> {
        let response = self.send(key, |http, url| {
            http.get(url).query(&[("recursive", recursive.to_string())])
        })?;
        let body = decode_response(key, response)?;
        parse_json::<NodeResponse>(key, &body).map(|r| r.node)
    }

    fn write(&self, key: &str, value: &str, condition: Condition) -> Result<u64, DatastoreError> {
        let response = self.send(key, |http, url| {
            let request = http.put(url).form(&[("value", value)]);
            match condition {
                Condition::None => request,
                Condition::PrevExist(exist) => request.query(&[("prevExist", exist.to_string())]),
                Condition::PrevIndex(index) => request.query(&[("prevIndex", index.to_string())]),
            }
        })?;
        let body = decode_response(key, response)?;
        parse_json::<NodeResponse>(key, &body).map(|r| r.node.modified_index)
    }

    fn delete(&self, key: &str, recursive: bool) -> Result<(), DatastoreError> {
        let response = self.send(key, |http, url| {
            let request = http.delete(url);
            if recursive {
                request.query(&[("recursive", "true")])
            } else {
                request
            }
        })?;
        decode_response(key, response).map(|_| ())
    }

    fn delete_dir(&self, key: &str) -> Result<(), DatastoreError> {
        let response = self.send(key, |http, url| http.delete(url).query(&[("dir", "true")]))?;
        decode_response(key, response).map(|_| ())
    }

    fn read_endpoint(&self, workload: &WorkloadKey, endpoint_id: &str) -> Result<Endpoint, DatastoreError> {
        let key = endpoint_key(workload, endpoint_id);
        let node = self.read(&key, false)?;
        endpoint_from_node(workload.clone(), &node)
    }

    fn write_endpoint(&self, endpoint: &mut Endpoint, condition: Condition) -> Result<(), DatastoreError> {
        let workload = endpoint
            .workload
            .clone()
            .ok_or_else(|| DatastoreError::NotFound(format!("workload of endpoint {}", endpoint.endpoint_id)))?;
        let key = endpoint_key(&workload, &endpoint.endpoint_id);
        let value = serde_json::to_string(endpoint).map_err(|error| DatastoreError::InvalidJson {
            key: key.clone(),
            error,
        })?;
        endpoint.revision = Some(self.write(&key, &value, condition)?);
        Ok(())
    }

    fn all_endpoints(&self) -> Result<Vec<Endpoint>, DatastoreError> {
        let root = match self.read(HOST_DIR, true) {
            Ok(root) => root,
            Err(DatastoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut endpoints = Vec::new();
        for leaf in root.leaves() {
            if let Some(workload) = parse_endpoint_key(&leaf.key) {
                match endpoint_from_node(workload, leaf) {
                    Ok(endpoint) => endpoints.push(endpoint),
                    Err(err) => warn!("Skipping unreadable endpoint {}: {}", leaf.key, err),
                }
            }
        }
        Ok(endpoints)
    }
}

impl Datastore for EtcdClient {
    #[tracing::instrument(skip(self))]
    fn get_endpoint(&self, key: &WorkloadKey) -> Result<Endpoint, DatastoreError> {
        let dir = format!("{}/endpoint", workload_key(key));
        let node = self.read(&dir, true)?;
        let leaves = node.leaves();
        match leaves.as_slice() {
            [] => Err(DatastoreError::NotFound(format!("endpoint for workload {}", key.workload_id))),
            [leaf] => endpoint_from_node(key.clone(), leaf),
            _ => Err(DatastoreError::MultipleEndpointsMatch(key.workload_id.clone())),
        }
    }

    #[tracing::instrument(skip(self))]
    fn create_endpoint(&self, key: &WorkloadKey, nets: &[IpNetwork]) -> Result<Endpoint, DatastoreError> {
        let endpoint_id = Uuid::new_v4().simple().to_string();
        let mut endpoint = Endpoint::new(key.clone(), endpoint_id, nets);
        self.write_endpoint(&mut endpoint, Condition::PrevExist(false))
            .map_err(|err| match err {
                DatastoreError::Conflict(what) => DatastoreError::AlreadyExists(what),
                other => other,
            })?;
        debug!("Created endpoint {}", endpoint.endpoint_id);
        Ok(endpoint)
    }

    fn set_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), DatastoreError> {
        self.write_endpoint(endpoint, Condition::None)
    }

    fn update_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), DatastoreError> {
        let condition = match endpoint.revision {
            Some(index) => Condition::PrevIndex(index),
            None => Condition::PrevExist(true),
        };
        self.write_endpoint(endpoint, condition)
    }

    #[tracing::instrument(skip(self, endpoint), fields(endpoint = %endpoint.endpoint_id))]
    fn remove_endpoint(&self, endpoint: &Endpoint) -> Result<(), DatastoreError> {
        let workload = endpoint
            .workload
            .as_ref()
            .ok_or_else(|| DatastoreError::NotFound(format!("workload of endpoint {}", endpoint.endpoint_id)))?;
        self.delete(&endpoint_key(workload, &endpoint.endpoint_id), false)?;

        // Tidy up the now-empty directories; failure just means something else still lives there.
        let _ = self.delete_dir(&format!("{}/endpoint", workload_key(workload)));
        let _ = self.delete_dir(&workload_key(workload));
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove_workload(&self, key: &WorkloadKey) -> Result<(), DatastoreError> {
        self.delete(&workload_key(key), true)
    }

    fn profile_exists(&self, name: &str) -> Result<bool, DatastoreError> {
        match self.read(&profile_key(name), false) {
            Ok(_) => Ok(true),
            Err(DatastoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(skip(self, rules))]
    fn create_profile(&self, name: &str, rules: Option<&Rules>, tags: &BTreeSet<String>) -> Result<(), DatastoreError> {
        let rules = rules.cloned().unwrap_or_else(|| Rules::default_for(name));
        let rules_key = format!("{}/rules", profile_key(name));
        let tags_key = format!("{}/tags", profile_key(name));

        let rules_json = serde_json::to_string(&rules).map_err(|error| DatastoreError::InvalidJson {
            key: rules_key.clone(),
            error,
        })?;
        let tags_json = serde_json::to_string(tags).map_err(|error| DatastoreError::InvalidJson {
            key: tags_key.clone(),
            error,
        })?;

        self.write(&rules_key, &rules_json, Condition::None)?;
        self.write(&tags_key, &tags_json, Condition::None)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove_profile(&self, name: &str) -> Result<(), DatastoreError> {
        self.delete(&profile_key(name), true)
    }

    fn get_profile_members(&self, name: &str) -> Result<Vec<Endpoint>, DatastoreError> {
        Ok(self
            .all_endpoints()?
            .into_iter()
            .filter(|endpoint| endpoint.profile_ids.iter().any(|p| p == name))
            .collect())
    }

    #[tracing::instrument(skip(self, endpoint), fields(endpoint = %endpoint.endpoint_id))]
    fn append_profiles_to_endpoint(&self, endpoint: &mut Endpoint, profile_names: &[String]) -> Result<(), DatastoreError> {
        for attempt in 0..CAS_RETRIES {
            let missing: Vec<String> = profile_names
                .iter()
                .filter(|name| !endpoint.profile_ids.contains(name))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(());
            }

            let mut updated = endpoint.clone();
            updated.profile_ids.extend(missing);
            match self.update_endpoint(&mut updated) {
                Ok(()) => {
                    *endpoint = updated;
                    return Ok(());
                }
                Err(DatastoreError::Conflict(_)) => {
                    debug!("Endpoint {} changed underneath us (attempt {}), re-reading", endpoint.endpoint_id, attempt + 1);
                    let workload = endpoint
                        .workload
                        .clone()
                        .ok_or_else(|| DatastoreError::NotFound(format!("workload of endpoint {}", endpoint.endpoint_id)))?;
                    *endpoint = self.read_endpoint(&workload, &endpoint.endpoint_id)?;
                    thread::sleep(Duration::from_millis(10 * (attempt as u64 + 1)));
                }
                Err(err) => return Err(err),
            }
        }
        Err(DatastoreError::Conflict(format!("endpoint {}", endpoint.endpoint_id)))
    }
}

impl IpamStore for EtcdClient {
    fn ip_pools(&self, version: u8) -> Result<Vec<IpNetwork>, DatastoreError> {
        let dir = format!("/calico/v1/ipam/v{}/pool", version);
        let node = match self.read(&dir, true) {
            Ok(node) => node,
            Err(DatastoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut pools = Vec::new();
        for leaf in node.leaves() {
            let value = leaf.value.as_deref().unwrap_or("");
            let record: PoolRecord = parse_json(&leaf.key, value)?;
            pools.push(record.cidr);
        }
        Ok(pools)
    }

    fn assigned_addresses(&self, pool: &IpNetwork) -> Result<BTreeSet<IpAddr>, DatastoreError> {
        let node = match self.read(ASSIGNMENT_DIR, false) {
            Ok(node) => node,
            Err(DatastoreError::NotFound(_)) => return Ok(BTreeSet::new()),
            Err(err) => return Err(err),
        };
        Ok(node
            .leaves()
            .into_iter()
            .filter_map(|leaf| leaf.name().parse::<IpAddr>().ok())
            .filter(|addr| pool.contains(*addr))
            .collect())
    }

    fn claim_address(&self, address: IpAddr, handle: &str) -> Result<(), DatastoreError> {
        let key = format!("{}/{}", ASSIGNMENT_DIR, address);
        self.write(&key, handle, Condition::PrevExist(false))
            .map_err(|err| match err {
                DatastoreError::Conflict(_) => DatastoreError::AlreadyExists(address.to_string()),
                other => other,
            })?;
        self.write(&format!("{}/{}/{}", HANDLE_DIR, handle, address), "", Condition::None)?;
        Ok(())
    }

    fn release_by_handle(&self, handle: &str) -> Result<Vec<IpAddr>, DatastoreError> {
        let dir = format!("{}/{}", HANDLE_DIR, handle);
        let node = self.read(&dir, false)?;
        let addresses: Vec<IpAddr> = node
            .leaves()
            .into_iter()
            .filter_map(|leaf| leaf.name().parse().ok())
            .collect();
        if addresses.is_empty() {
            return Err(DatastoreError::NotFound(format!("addresses for handle {}", handle)));
        }
        for address in &addresses {
            match self.delete(&format!("{}/{}", ASSIGNMENT_DIR, address), false) {
                Ok(()) | Err(DatastoreError::NotFound(_)) => (),
                Err(err) => return Err(err),
            }
        }
        self.delete(&dir, true)?;
        Ok(addresses)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DatastoreError> {
    fs::read(path).map_err(|error| DatastoreError::Config(format!("could not read {}: {}", path.display(), error)))
}

fn decode_response(key: &str, response: Response) -> Result<String, DatastoreError> {
    let status = response.status();
    let body = response.text().map_err(|error| DatastoreError::Transport {
        context: format!("could not read response for {}", key),
        error,
    })?;
    if status.is_success() {
        return Ok(body);
    }

    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => Err(etcd_error(key, err)),
        Err(_) if status == StatusCode::NOT_FOUND => Err(DatastoreError::NotFound(key.into())),
        Err(_) => Err(DatastoreError::Server {
            code: status.as_u16() as u64,
            message: body,
        }),
    }
}

fn etcd_error(key: &str, err: ErrorResponse) -> DatastoreError {
    let what = err.cause.unwrap_or_else(|| key.to_string());
    match err.error_code {
        ETCD_KEY_NOT_FOUND => DatastoreError::NotFound(what),
        ETCD_COMPARE_FAILED | ETCD_NODE_EXISTS => DatastoreError::Conflict(what),
        code => DatastoreError::Server {
            code,
            message: err.message,
        },
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, body: &str) -> Result<T, DatastoreError> {
    serde_json::from_str(body).map_err(|error| DatastoreError::InvalidJson {
        key: key.into(),
        error,
    })
}

fn endpoint_from_node(workload: WorkloadKey, node: &Node) -> Result<Endpoint, DatastoreError> {
    let mut endpoint: Endpoint = parse_json(&node.key, node.value.as_deref().unwrap_or(""))?;
    endpoint.workload = Some(workload);
    endpoint.endpoint_id = node.name().to_string();
    endpoint.revision = Some(node.modified_index);
    Ok(endpoint)
}

fn workload_key(key: &WorkloadKey) -> String {
    format!(
        "{}/{}/workload/{}/{}",
        HOST_DIR, key.hostname, key.orchestrator_id, key.workload_id
    )
}

fn endpoint_key(key: &WorkloadKey, endpoint_id: &str) -> String {
    format!("{}/endpoint/{}", workload_key(key), endpoint_id)
}

fn profile_key(name: &str) -> String {
    format!("{}/{}", PROFILE_DIR, name)
}

/// Recovers the workload from `/calico/v1/host/<h>/workload/<o>/<w>/endpoint/<id>`.
fn parse_endpoint_key(key: &str) -> Option<WorkloadKey> {
    let parts: Vec<&str> = key.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        ["calico", "v1", "host", host, "workload", orchestrator, workload, "endpoint", _] => {
            Some(WorkloadKey::new(*host, *orchestrator, *workload))
        }
        _ => None,
    }
}
