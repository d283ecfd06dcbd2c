//! Policy drivers: how an endpoint gets its security profile.
//!
//! Which driver runs depends on the configured policy type and the orchestrator, see [`select_policy_driver`].

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info};

use crate::datastore::{Datastore, DatastoreError, Endpoint, Rules};
use crate::kubernetes::{ApiConfig, KubernetesClient, KubernetesError, PodSource};
use crate::network::cni::args::RequestContext;
use crate::network::cni::schema::NetworkConfiguration;

pub mod default;
pub mod kubernetes;
pub mod parser;

pub use self::default::{DefaultPolicyDriver, KubernetesNoPolicyDriver, MesosPolicyDriver};
pub use self::kubernetes::{KubernetesAnnotationDriver, KubernetesPolicyDriver};

pub const POLICY_MODE_K8S: &str = "k8s";
pub const POLICY_MODE_K8S_ANNOTATIONS: &str = "k8s-annotations";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(
        "Invalid characters detected in the given profile name, {0}. Only letters a-z, numbers 0-9, and symbols _.- are supported."
    )]
    InvalidProfileName(String),

    #[error("Invalid policy type: {0}")]
    UnknownPolicyType(String),

    #[error("Configured {setting} {} does not exist", path.display())]
    MissingFile { setting: &'static str, path: PathBuf },

    #[error("Kubernetes API configuration error")]
    Kubernetes(#[from] KubernetesError),

    #[error("{message}")]
    ApplyProfile { message: String, details: Option<String> },

    #[error("could not remove profile {name}")]
    RemoveProfile {
        name: String,
        #[source]
        error: DatastoreError,
    },
}

impl PolicyError {
    pub fn apply<S: Into<String>>(message: S) -> PolicyError {
        PolicyError::ApplyProfile {
            message: message.into(),
            details: None,
        }
    }

    pub fn apply_with_details<S: Into<String>, D: ToString>(message: S, details: D) -> PolicyError {
        PolicyError::ApplyProfile {
            message: message.into(),
            details: Some(details.to_string()),
        }
    }
}

/// Applies and removes the security profile of one workload's endpoint.
pub trait PolicyDriver {
    fn profile_name(&self) -> &str;

    /// Attaches the profile to the endpoint, creating it first if needed. Errors are always
    /// [`PolicyError::ApplyProfile`].
    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError>;

    fn remove_profile(&self) -> Result<(), PolicyError>;
}

/// The available drivers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DriverKind {
    /// Profile per network, inbound only from the same network.
    Default,
    /// [`DriverKind::Default`] plus Mesos labels on the endpoint.
    Mesos,
    /// Kubernetes without policy: everything allowed.
    KubernetesNoPolicy,
    /// Profile per pod, rules from the pod's annotation.
    KubernetesAnnotations,
    /// Kubernetes NetworkPolicy, enforced elsewhere from the labels written onto the endpoint.
    KubernetesPolicy,
}

/// Chooses a driver from the configured policy type and the orchestrator. An unrecognized policy type is an error
/// whatever the orchestrator.
pub fn select_policy_driver(policy_type: Option<&str>, ctx: &RequestContext) -> Result<DriverKind, PolicyError> {
    match policy_type {
        None | Some(POLICY_MODE_K8S) | Some(POLICY_MODE_K8S_ANNOTATIONS) => (),
        Some(other) => return Err(PolicyError::UnknownPolicyType(other.into())),
    }

    let kind = if ctx.running_under_k8s() {
        match policy_type {
            Some(POLICY_MODE_K8S_ANNOTATIONS) => DriverKind::KubernetesAnnotations,
            Some(POLICY_MODE_K8S) => DriverKind::KubernetesPolicy,
            _ => DriverKind::KubernetesNoPolicy,
        }
    } else if ctx.running_under_mesos() {
        DriverKind::Mesos
    } else {
        DriverKind::Default
    };
    Ok(kind)
}

/// Builds the driver selected for this invocation.
pub fn build_policy_driver<'a>(
    config: &NetworkConfiguration,
    ctx: &RequestContext,
    datastore: &'a dyn Datastore,
) -> Result<Box<dyn PolicyDriver + 'a>, PolicyError> {
    let policy_type = config.policy.as_ref().and_then(|p| p.policy_type.as_deref());
    let kind = select_policy_driver(policy_type, ctx)?;
    info!("Using policy driver {:?}", kind);

    let driver: Box<dyn PolicyDriver + 'a> = match kind {
        DriverKind::Default => Box::new(DefaultPolicyDriver::new(&ctx.network_name, datastore)?),
        DriverKind::Mesos => Box::new(MesosPolicyDriver::new(&ctx.network_name, ctx.labels.clone(), datastore)?),
        DriverKind::KubernetesNoPolicy => Box::new(KubernetesNoPolicyDriver::new(&ctx.network_name, datastore)?),
        DriverKind::KubernetesAnnotations | DriverKind::KubernetesPolicy => {
            let pod = ctx
                .pod
                .clone()
                .ok_or_else(|| PolicyError::apply("Kubernetes policy requires a pod name and namespace"))?;
            let api = kubernetes_client(config)?;
            if kind == DriverKind::KubernetesAnnotations {
                Box::new(KubernetesAnnotationDriver::new(pod, api, datastore)?)
            } else {
                Box::new(KubernetesPolicyDriver::new(pod, api, datastore))
            }
        }
    };
    Ok(driver)
}

fn kubernetes_client(config: &NetworkConfiguration) -> Result<Box<dyn PodSource>, PolicyError> {
    let api = ApiConfig::from_network_config(config)?;
    for (setting, path) in api.files() {
        if !path.exists() {
            return Err(PolicyError::MissingFile {
                setting,
                path: path.into(),
            });
        }
    }
    Ok(Box::new(KubernetesClient::new(api)?))
}

/// Profile names may only contain letters, digits and `_.-`.
pub fn validate_profile_name(name: &str) -> Result<(), PolicyError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(PolicyError::InvalidProfileName(name.into()))
    }
}

/// The part of applying a profile every driver shares: create the profile if it doesn't exist yet, then attach
/// it to the endpoint. `generate` is only called when the profile has to be created; `None` rules means the
/// datastore's default rules.
pub(crate) fn set_profile<F>(
    datastore: &dyn Datastore,
    profile_name: &str,
    endpoint: &mut Endpoint,
    generate: F,
) -> Result<(), PolicyError>
where
    F: FnOnce() -> Result<(Option<Rules>, BTreeSet<String>), PolicyError>,
{
    let exists = datastore
        .profile_exists(profile_name)
        .map_err(|err| PolicyError::apply_with_details(format!("Failed to look up profile {}", profile_name), err))?;

    if !exists {
        info!("Creating new profile '{}'", profile_name);
        let (rules, tags) = generate()?;
        datastore
            .create_profile(profile_name, rules.as_ref(), &tags)
            .map_err(|err| PolicyError::apply_with_details(format!("Failed to create profile {}", profile_name), err))?;
    }

    if endpoint.profile_ids.iter().any(|id| id == profile_name) {
        info!("Profile '{}' is already on endpoint {}", profile_name, endpoint.endpoint_id);
        return Ok(());
    }

    info!("Setting profile '{}' on endpoint {}", profile_name, endpoint.endpoint_id);
    if let Err(err) = datastore.append_profiles_to_endpoint(endpoint, &[profile_name.to_string()]) {
        error!("Failed to apply profile to endpoint {}: {}", endpoint.name, err);
        return Err(PolicyError::apply(err.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::cni::args::tests::{environment, network_config};
    use crate::testing::MemoryStore;

    fn context(cni_args: &str, args: serde_json::Value) -> RequestContext {
        let config = network_config(json!({
            "name": "net1",
            "type": "calico",
            "ipam": {"type": "calico-ipam"},
            "args": args
        }));
        RequestContext::new(&environment("ADD", cni_args), &config).unwrap()
    }

    const K8S_ARGS: &str = "K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx";

    #[test]
    fn test_select_driver() {
        let plain = context("", json!({}));
        let k8s = context(K8S_ARGS, json!({}));
        let mesos = context("", json!({"org.apache.mesos": {"network_info": {}}}));

        assert_eq!(select_policy_driver(None, &plain).unwrap(), DriverKind::Default);
        assert_eq!(select_policy_driver(None, &mesos).unwrap(), DriverKind::Mesos);
        assert_eq!(select_policy_driver(Some("k8s"), &mesos).unwrap(), DriverKind::Mesos);
        assert_eq!(select_policy_driver(None, &k8s).unwrap(), DriverKind::KubernetesNoPolicy);
        assert_eq!(
            select_policy_driver(Some("k8s-annotations"), &k8s).unwrap(),
            DriverKind::KubernetesAnnotations
        );
        assert_eq!(select_policy_driver(Some("k8s"), &k8s).unwrap(), DriverKind::KubernetesPolicy);
    }

    #[test]
    fn test_unknown_policy_type() {
        for ctx in &[context("", json!({})), context(K8S_ARGS, json!({}))] {
            let err = select_policy_driver(Some("calico"), ctx).unwrap_err();
            assert_eq!(err.to_string(), "Invalid policy type: calico");
        }
    }

    #[test]
    fn test_profile_names() {
        assert!(validate_profile_name("net1").is_ok());
        assert!(validate_profile_name("kube-system_my.pod").is_ok());
        for bad in &["net=1", "^net", "net$", "", "net 1", "net/1"] {
            assert!(matches!(
                validate_profile_name(bad),
                Err(PolicyError::InvalidProfileName(_))
            ));
        }
    }

    #[test]
    fn test_missing_certificate() {
        let config = network_config(json!({
            "name": "net1",
            "type": "calico",
            "ipam": {"type": "calico-ipam"},
            "policy": {"type": "k8s", "k8s_client_certificate": "/nonexistent/cert.pem"}
        }));
        let ctx = RequestContext::new(&environment("ADD", K8S_ARGS), &config).unwrap();
        let store = MemoryStore::default();
        match build_policy_driver(&config, &ctx, &store) {
            Err(PolicyError::MissingFile { setting, .. }) => assert_eq!(setting, "k8s_client_certificate"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("driver built with a missing certificate"),
        };
    }

    #[test]
    fn test_build_default_driver() {
        let config = network_config(json!({"name": "net1", "type": "calico", "ipam": {"type": "calico-ipam"}}));
        let ctx = RequestContext::new(&environment("ADD", ""), &config).unwrap();
        let store = MemoryStore::default();
        let driver = build_policy_driver(&config, &ctx, &store).unwrap();
        assert_eq!(driver.profile_name(), "net1");
    }
}
