//! Parsing of the CNI invocation environment into a [`RequestContext`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::schema::NetworkConfiguration;

pub const CNI_COMMAND_ENV: &str = "CNI_COMMAND";
pub const CNI_CONTAINERID_ENV: &str = "CNI_CONTAINERID";
pub const CNI_NETNS_ENV: &str = "CNI_NETNS";
pub const CNI_IFNAME_ENV: &str = "CNI_IFNAME";
pub const CNI_ARGS_ENV: &str = "CNI_ARGS";
pub const CNI_PATH_ENV: &str = "CNI_PATH";

pub const K8S_POD_NAME: &str = "K8S_POD_NAME";
pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";

/// `CNI_ARGS` key requesting a specific IPv4 address from `calico-ipam`.
pub const CNI_ARGS_IP: &str = "IP";

pub const ORCHESTRATOR_CNI: &str = "cni";
pub const ORCHESTRATOR_K8S: &str = "k8s";

const MESOS_NS_KEY: &str = "org.apache.mesos";
const MESOS_NETWORK_INFO_KEY: &str = "network_info";
const MESOS_LABELS_OUTER_KEY: &str = "labels";
const MESOS_LABELS_KEY: &str = "labels";

/// Snapshot of the process environment, sorted so it logs and compares deterministically.
pub type Environment = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("{0} not found in environment")]
    Missing(&'static str),

    #[error("invalid command '{0}'")]
    InvalidCommand(String),
}

/// A CNI command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
        }
    }

    pub fn parse(value: &str) -> Result<Command, ArgsError> {
        match value {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            other => Err(ArgsError::InvalidCommand(other.into())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes pod identity, present when the runtime passed both pod name and namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// Everything known about one plugin invocation. Built once at startup and never modified.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub command: Command,
    pub container_id: String,
    pub netns: PathBuf,
    pub interface: String,
    pub network_name: String,
    pub ipam_type: String,
    /// Colon-separated search path for plugin binaries.
    pub cni_path: String,
    pub cni_args: HashMap<String, String>,
    pub pod: Option<PodRef>,
    /// Raw `args` from the network configuration.
    pub args: HashMap<String, Value>,
    /// Labels extracted from orchestrator-specific arguments.
    pub labels: BTreeMap<String, String>,
    /// Environment to invoke the IPAM plugin with.
    pub ipam_env: Environment,
}

impl RequestContext {
    pub fn new(env: &Environment, config: &NetworkConfiguration) -> Result<RequestContext, ArgsError> {
        let command = Command::parse(required(env, CNI_COMMAND_ENV)?)?;
        let container_id = required(env, CNI_CONTAINERID_ENV)?.to_string();
        let netns = PathBuf::from(required(env, CNI_NETNS_ENV)?);
        let interface = required(env, CNI_IFNAME_ENV)?.to_string();
        let cni_path = required(env, CNI_PATH_ENV)?.to_string();

        let raw_args = env.get(CNI_ARGS_ENV).map(String::as_str).unwrap_or("");
        let cni_args = parse_cni_args(raw_args);

        let pod = match (cni_args.get(K8S_POD_NAMESPACE), cni_args.get(K8S_POD_NAME)) {
            (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => Some(PodRef {
                namespace: namespace.clone(),
                name: name.clone(),
            }),
            _ => None,
        };

        Ok(RequestContext {
            command,
            container_id,
            netns,
            interface,
            network_name: config.name.clone(),
            ipam_type: config.ipam.plugin_type.clone(),
            cni_path,
            cni_args,
            pod,
            labels: mesos_labels(&config.args),
            args: config.args.clone(),
            ipam_env: ipam_environment(env),
        })
    }

    pub fn running_under_k8s(&self) -> bool {
        self.pod.is_some()
    }

    pub fn running_under_mesos(&self) -> bool {
        self.args.contains_key(MESOS_NS_KEY)
    }

    pub fn orchestrator_id(&self) -> &'static str {
        if self.running_under_k8s() {
            ORCHESTRATOR_K8S
        } else {
            ORCHESTRATOR_CNI
        }
    }

    /// `{namespace}.{pod}` under Kubernetes, otherwise the container ID.
    pub fn workload_id(&self) -> String {
        match &self.pod {
            Some(pod) => format!("{}.{}", pod.namespace, pod.name),
            None => self.container_id.clone(),
        }
    }

    /// Short identifier used to tag log output.
    pub fn identity(&self) -> String {
        identity(&self.cni_args, &self.container_id)
    }

    /// IPAM environment with `CNI_COMMAND` overridden.
    pub fn ipam_env_for(&self, command: Command) -> Environment {
        let mut env = self.ipam_env.clone();
        env.insert(CNI_COMMAND_ENV.into(), command.as_str().into());
        env
    }
}

fn required<'a>(env: &'a Environment, key: &'static str) -> Result<&'a str, ArgsError> {
    env.get(key).map(String::as_str).ok_or(ArgsError::Missing(key))
}

/// Parses a `CNI_ARGS` string such as `FOO=BAR;ABC=123`. Malformed pairs are skipped.
pub fn parse_cni_args(cni_args: &str) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    for pair in cni_args.split(';') {
        let (key, value) = match pair.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() || !is_arg_text(key) || !is_arg_text(value) {
            debug!("Ignoring malformed CNI_ARG {:?}", pair);
            continue;
        }
        debug!("Parsed CNI_ARG: {}={}", key, value);
        parsed.insert(key.to_string(), value.to_string());
    }
    parsed
}

fn is_arg_text(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ' ' | ':'))
}

/// Log identity: `namespace/pod` under Kubernetes, else the first 8 characters of the container ID.
pub fn identity(cni_args: &HashMap<String, String>, container_id: &str) -> String {
    if let Some(pod) = cni_args.get(K8S_POD_NAME) {
        let namespace = cni_args
            .get(K8S_POD_NAMESPACE)
            .map(String::as_str)
            .unwrap_or("unknown");
        format!("{}/{}", namespace, pod)
    } else {
        container_id.chars().take(8).collect()
    }
}

/// The IPAM plugin gets our environment with `IgnoreUnknown=1` prepended to `CNI_ARGS`, so that plugins that
/// don't understand the Kubernetes arguments don't reject them.
pub fn ipam_environment(env: &Environment) -> Environment {
    let mut ipam_env = env.clone();
    let mut args = String::from("IgnoreUnknown=1");
    if let Some(existing) = env.get(CNI_ARGS_ENV).filter(|a| !a.is_empty()) {
        args.push(';');
        args.push_str(existing);
    }
    ipam_env.insert(CNI_ARGS_ENV.into(), args);
    ipam_env
}

/// Mesos labels live at `args["org.apache.mesos"].network_info.labels.labels` as a list of `{key, value}`.
pub fn mesos_labels(args: &HashMap<String, Value>) -> BTreeMap<String, String> {
    let list = args
        .get(MESOS_NS_KEY)
        .and_then(|ns| ns.get(MESOS_NETWORK_INFO_KEY))
        .and_then(|info| info.get(MESOS_LABELS_OUTER_KEY))
        .and_then(|outer| outer.get(MESOS_LABELS_KEY))
        .and_then(Value::as_array);

    let mut labels = BTreeMap::new();
    for label in list.into_iter().flatten() {
        if let (Some(key), Some(value)) = (
            label.get("key").and_then(Value::as_str),
            label.get("value").and_then(Value::as_str),
        ) {
            labels.insert(key.to_string(), value.to_string());
        }
    }
    labels
}
