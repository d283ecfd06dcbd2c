//! Drivers that name the profile after the network.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::{set_profile, validate_profile_name, PolicyDriver, PolicyError};
use crate::datastore::{Datastore, Endpoint, Rules};

/// Containers on the same network can reach each other; anything may go out.
///
/// Profiles are never removed. Deleting one races with another container creating it again, so they are left for
/// manual cleanup.
pub struct DefaultPolicyDriver<'a> {
    profile_name: String,
    datastore: &'a dyn Datastore,
}

impl<'a> DefaultPolicyDriver<'a> {
    pub fn new(network_name: &str, datastore: &'a dyn Datastore) -> Result<DefaultPolicyDriver<'a>, PolicyError> {
        validate_profile_name(network_name)?;
        Ok(DefaultPolicyDriver {
            profile_name: network_name.into(),
            datastore,
        })
    }

    fn tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        tags.insert(self.profile_name.clone());
        tags
    }
}

impl PolicyDriver for DefaultPolicyDriver<'_> {
    fn profile_name(&self) -> &str {
        &self.profile_name
    }

    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError> {
        set_profile(self.datastore, &self.profile_name, endpoint, || Ok((None, self.tags())))
    }

    fn remove_profile(&self) -> Result<(), PolicyError> {
        info!("Not removing profile {}. Clean up manually if desired", self.profile_name);
        Ok(())
    }
}

/// [`DefaultPolicyDriver`] that also records the task's Mesos labels on the endpoint.
pub struct MesosPolicyDriver<'a> {
    inner: DefaultPolicyDriver<'a>,
    labels: BTreeMap<String, String>,
}

impl<'a> MesosPolicyDriver<'a> {
    pub fn new(
        network_name: &str,
        labels: BTreeMap<String, String>,
        datastore: &'a dyn Datastore,
    ) -> Result<MesosPolicyDriver<'a>, PolicyError> {
        Ok(MesosPolicyDriver {
            inner: DefaultPolicyDriver::new(network_name, datastore)?,
            labels,
        })
    }
}

impl PolicyDriver for MesosPolicyDriver<'_> {
    fn profile_name(&self) -> &str {
        self.inner.profile_name()
    }

    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError> {
        if !self.labels.is_empty() {
            debug!("Setting labels {:?} on endpoint {}", self.labels, endpoint.endpoint_id);
            endpoint.labels.extend(self.labels.clone());
            self.inner
                .datastore
                .update_endpoint(endpoint)
                .map_err(|err| PolicyError::apply_with_details("Failed to set labels on endpoint", err))?;
        }
        self.inner.apply_profile(endpoint)
    }

    fn remove_profile(&self) -> Result<(), PolicyError> {
        self.inner.remove_profile()
    }
}

/// Kubernetes without a policy type: one allow-everything profile per network.
pub struct KubernetesNoPolicyDriver<'a> {
    inner: DefaultPolicyDriver<'a>,
}

impl<'a> KubernetesNoPolicyDriver<'a> {
    pub fn new(network_name: &str, datastore: &'a dyn Datastore) -> Result<KubernetesNoPolicyDriver<'a>, PolicyError> {
        Ok(KubernetesNoPolicyDriver {
            inner: DefaultPolicyDriver::new(network_name, datastore)?,
        })
    }
}

impl PolicyDriver for KubernetesNoPolicyDriver<'_> {
    fn profile_name(&self) -> &str {
        self.inner.profile_name()
    }

    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError> {
        let name = self.profile_name();
        set_profile(self.inner.datastore, name, endpoint, || {
            Ok((Some(Rules::allow_all(name)), self.inner.tags()))
        })
    }

    fn remove_profile(&self) -> Result<(), PolicyError> {
        self.inner.remove_profile()
    }
}
