//! Drivers that take policy from the Kubernetes API.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::parser::parse_rules;
use super::{set_profile, validate_profile_name, PolicyDriver, PolicyError};
use crate::datastore::{Datastore, DatastoreError, Endpoint, Rule, Rules};
use crate::kubernetes::{Pod, PodSource};
use crate::network::cni::args::PodRef;

/// Pod annotation holding inbound rules, see [`super::parser`].
pub const POLICY_ANNOTATION: &str = "projectcalico.org/policy";

/// Endpoint label carrying the pod's namespace.
pub const NAMESPACE_LABEL: &str = "calico/k8s_ns";

const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

fn fetch_pod(api: &dyn PodSource, pod: &PodRef) -> Result<Pod, PolicyError> {
    api.get_pod(&pod.namespace, &pod.name).map_err(|err| {
        warn!("Could not fetch pod {}/{}: {}", pod.namespace, pod.name, err);
        PolicyError::apply_with_details(format!("Failed to get pod {}/{}", pod.namespace, pod.name), err)
    })
}

/// One profile per pod, named `{namespace}_{pod}`.
///
/// Inbound rules come from the pod's [`POLICY_ANNOTATION`]; without one, only pods in the same namespace may
/// connect. `kube-system` pods accept everything.
pub struct KubernetesAnnotationDriver<'a> {
    pod: PodRef,
    profile_name: String,
    api: Box<dyn PodSource>,
    datastore: &'a dyn Datastore,
}

impl<'a> KubernetesAnnotationDriver<'a> {
    pub fn new(
        pod: PodRef,
        api: Box<dyn PodSource>,
        datastore: &'a dyn Datastore,
    ) -> Result<KubernetesAnnotationDriver<'a>, PolicyError> {
        let profile_name = format!("{}_{}", pod.namespace, pod.name);
        validate_profile_name(&profile_name)?;
        Ok(KubernetesAnnotationDriver {
            pod,
            profile_name,
            api,
            datastore,
        })
    }

    fn namespace_tag(&self) -> String {
        format!("{0}_{0}", self.pod.namespace)
    }

    fn generate_rules(&self, pod: &Pod) -> Result<Rules, PolicyError> {
        let namespace = &self.pod.namespace;
        if namespace == KUBE_SYSTEM_NAMESPACE {
            debug!("Pod is in {}, allowing all traffic", KUBE_SYSTEM_NAMESPACE);
            return Ok(Rules::allow_all(self.profile_name.as_str()));
        }

        let inbound_rules = match pod.metadata.annotations.get(POLICY_ANNOTATION) {
            Some(annotation) => {
                info!("Using policy annotation {:?}", annotation);
                parse_rules(namespace, annotation).map_err(|err| {
                    warn!("Could not parse policy annotation: {}", err);
                    PolicyError::apply_with_details("Failed to parse policy annotation", err)
                })?
            }
            None => vec![Rule::allow_from_tag(self.namespace_tag())],
        };

        Ok(Rules {
            id: self.profile_name.clone(),
            inbound_rules,
            outbound_rules: vec![Rule::allow()],
        })
    }

    fn generate_tags(&self, pod: &Pod) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        tags.insert(self.namespace_tag());
        for (key, value) in &pod.metadata.labels {
            tags.insert(format!("{}_{}_{}", self.pod.namespace, key, value));
        }
        tags
    }
}

impl PolicyDriver for KubernetesAnnotationDriver<'_> {
    fn profile_name(&self) -> &str {
        &self.profile_name
    }

    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError> {
        set_profile(self.datastore, &self.profile_name, endpoint, || {
            let pod = fetch_pod(self.api.as_ref(), &self.pod)?;
            Ok((Some(self.generate_rules(&pod)?), self.generate_tags(&pod)))
        })
    }

    /// Deletes the profile outright. A profile that is already gone counts as removed.
    fn remove_profile(&self) -> Result<(), PolicyError> {
        info!("Deleting profile {}", self.profile_name);
        match self.datastore.remove_profile(&self.profile_name) {
            Ok(()) => Ok(()),
            Err(DatastoreError::NotFound(_)) => {
                debug!("Profile {} was already deleted", self.profile_name);
                Ok(())
            }
            Err(err) => Err(PolicyError::RemoveProfile {
                name: self.profile_name.clone(),
                error: err,
            }),
        }
    }
}

/// Kubernetes NetworkPolicy: policy is enforced from the endpoint's labels, so this only copies the pod's labels
/// (plus its namespace) onto the endpoint.
pub struct KubernetesPolicyDriver<'a> {
    pod: PodRef,
    api: Box<dyn PodSource>,
    datastore: &'a dyn Datastore,
}

impl<'a> KubernetesPolicyDriver<'a> {
    pub fn new(pod: PodRef, api: Box<dyn PodSource>, datastore: &'a dyn Datastore) -> KubernetesPolicyDriver<'a> {
        KubernetesPolicyDriver { pod, api, datastore }
    }
}

impl PolicyDriver for KubernetesPolicyDriver<'_> {
    fn profile_name(&self) -> &str {
        ""
    }

    fn apply_profile(&self, endpoint: &mut Endpoint) -> Result<(), PolicyError> {
        let pod = fetch_pod(self.api.as_ref(), &self.pod)?;
        let mut labels = pod.metadata.labels;
        labels.insert(NAMESPACE_LABEL.into(), self.pod.namespace.clone());

        debug!("Setting labels {:?} on endpoint {}", labels, endpoint.endpoint_id);
        endpoint.labels = labels;
        self.datastore.update_endpoint(endpoint).map_err(|err| {
            PolicyError::apply_with_details(format!("Failed to set labels on endpoint {}", endpoint.name), err)
        })
    }

    fn remove_profile(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::datastore::{PortRange, WorkloadKey};
    use crate::testing::{FakePods, MemoryStore};

    fn pod_ref(namespace: &str) -> PodRef {
        PodRef {
            namespace: namespace.into(),
            name: "nginx".into(),
        }
    }

    fn pod(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        pod.metadata.annotations = annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        pod
    }

    fn endpoint(store: &MemoryStore, namespace: &str) -> Endpoint {
        store
            .create_endpoint(
                &WorkloadKey::new("host1", "k8s", format!("{}.nginx", namespace)),
                &["10.0.0.5/32".parse().unwrap()],
            )
            .unwrap()
    }

    #[test]
    fn test_namespace_isolation_by_default() {
        let store = MemoryStore::default();
        let mut endpoint = endpoint(&store, "default");
        let api = FakePods::with(pod(&[("app", "web")], &[]));
        let driver = KubernetesAnnotationDriver::new(pod_ref("default"), Box::new(api), &store).unwrap();

        driver.apply_profile(&mut endpoint).unwrap();
        let (rules, tags) = store.profile("default_nginx").unwrap();
        assert_eq!(rules.inbound_rules, vec![Rule::allow_from_tag("default_default")]);
        assert_eq!(rules.outbound_rules, vec![Rule::allow()]);
        assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec!["default_app_web", "default_default"]
        );
        assert_eq!(endpoint.profile_ids, vec!["default_nginx"]);
    }

    #[test]
    fn test_kube_system_allows_all() {
        let store = MemoryStore::default();
        let mut endpoint = endpoint(&store, "kube-system");
        let api = FakePods::with(pod(&[], &[(POLICY_ANNOTATION, "allow tcp to ports 53")]));
        KubernetesAnnotationDriver::new(pod_ref("kube-system"), Box::new(api), &store)
            .unwrap()
            .apply_profile(&mut endpoint)
            .unwrap();
        assert_eq!(store.profile("kube-system_nginx").unwrap().0, Rules::allow_all("kube-system_nginx"));
    }

    #[test]
    fn test_annotation_rules() {
        let store = MemoryStore::default();
        let mut endpoint = endpoint(&store, "prod");
        let api = FakePods::with(pod(&[], &[(POLICY_ANNOTATION, "allow tcp from label role=fe to ports 80")]));
        KubernetesAnnotationDriver::new(pod_ref("prod"), Box::new(api), &store)
            .unwrap()
            .apply_profile(&mut endpoint)
            .unwrap();

        let (rules, _) = store.profile("prod_nginx").unwrap();
        assert_eq!(
            rules.inbound_rules,
            vec![Rule {
                protocol: Some("tcp".into()),
                src_tag: Some("prod_role_fe".into()),
                dst_ports: vec![PortRange::Single(80)],
                ..Rule::allow()
            }]
        );
    }

    #[test]
    fn test_bad_annotation_is_apply_error() {
        let store = MemoryStore::default();
        let mut endpoint = endpoint(&store, "prod");
        let api = FakePods::with(pod(&[], &[(POLICY_ANNOTATION, "deny everything")]));
        let err = KubernetesAnnotationDriver::new(pod_ref("prod"), Box::new(api), &store)
            .unwrap()
            .apply_profile(&mut endpoint)
            .unwrap_err();
        match err {
            PolicyError::ApplyProfile { message, details } => {
                assert_eq!(message, "Failed to parse policy annotation");
                assert!(details.is_some());
            }
            other => panic!("unexpected error {}", other),
        }
        assert!(store.profile("prod_nginx").is_none());
    }

    #[test]
    fn test_pod_lookup_failure_is_apply_error() {
        let store = MemoryStore::default();
        let mut endpoint = endpoint(&store, "default");
        let err = KubernetesAnnotationDriver::new(pod_ref("default"), Box::new(FakePods::missing()), &store)
            .unwrap()
            .apply_profile(&mut endpoint)
            .unwrap_err();
        assert!(matches!(err, PolicyError::ApplyProfile { .. }));
    }

    #[test]
    fn test_remove_profile() {
        let store = MemoryStore::default();
        let driver =
            KubernetesAnnotationDriver::new(pod_ref("default"), Box::new(FakePods::with(Pod::default())), &store)
                .unwrap();

        let mut endpoint = endpoint(&store, "default");
        driver.apply_profile(&mut endpoint).unwrap();
        assert!(store.profile("default_nginx").is_some());

        driver.remove_profile().unwrap();
        assert!(store.profile("default_nginx").is_none());

        // Already gone.
        driver.remove_profile().unwrap();
        assert_eq!(store.count_calls("get_profile_members"), 0);
    }

    #[test]
    fn test_invalid_pod_name() {
        let store = MemoryStore::default();
        let pod = PodRef {
            namespace: "default".into(),
            name: "bad$name".into(),
        };
        assert!(KubernetesAnnotationDriver::new(pod, Box::new(FakePods::missing()), &store).is_err());
    }

    #[test]
    fn test_policy_driver_sets_labels() {
        let store = MemoryStore::default();
        let mut endpoint = endpoint(&store, "default");
        let api = FakePods::with(pod(&[("app", "web")], &[]));
        let driver = KubernetesPolicyDriver::new(pod_ref("default"), Box::new(api), &store);

        driver.apply_profile(&mut endpoint).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("app".to_string(), "web".to_string());
        expected.insert(NAMESPACE_LABEL.to_string(), "default".to_string());
        assert_eq!(endpoint.labels, expected);
        assert_eq!(
            store.get_endpoint(&WorkloadKey::new("host1", "k8s", "default.nginx")).unwrap().labels,
            expected
        );
        assert!(endpoint.profile_ids.is_empty());
        driver.remove_profile().unwrap();
    }
}
