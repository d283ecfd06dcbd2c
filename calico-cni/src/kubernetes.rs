//! Minimal Kubernetes API client: just enough to read a pod's labels and annotations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fs, io};

use reqwest::blocking::Client;
use reqwest::{Certificate, Identity};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::network::cni::schema::NetworkConfiguration;

pub const DEFAULT_API_ROOT: &str = "https://10.100.0.1:443/api/v1/";

#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("could not read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("invalid kubeconfig {}", path.display())]
    KubeconfigYaml {
        path: PathBuf,
        #[source]
        error: serde_yaml::Error,
    },

    #[error("unusable kubeconfig {}: {reason}", path.display())]
    Kubeconfig { path: PathBuf, reason: String },

    #[error("invalid Kubernetes API configuration: {0}")]
    Config(String),

    #[error("Kubernetes API request failed: {context}")]
    Transport {
        context: String,
        #[source]
        error: reqwest::Error,
    },

    #[error("Kubernetes API returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("invalid pod returned from {url}")]
    InvalidPod {
        url: String,
        #[source]
        error: serde_json::Error,
    },
}

/// How to reach the API server.
#[derive(Debug, Clone, PartialEq, Eq, derive_builder::Builder)]
pub struct ApiConfig {
    /// Base URL of the v1 API, such as `https://10.100.0.1:443/api/v1/`.
    #[builder(setter(into), default = "DEFAULT_API_ROOT.to_string()")]
    pub api_root: String,

    #[builder(setter(into, strip_option), default)]
    pub auth_token: Option<String>,

    #[builder(setter(into, strip_option), default)]
    pub client_certificate: Option<PathBuf>,

    #[builder(setter(into, strip_option), default)]
    pub client_key: Option<PathBuf>,

    /// Without one, the server certificate is not verified.
    #[builder(setter(into, strip_option), default)]
    pub certificate_authority: Option<PathBuf>,
}

impl ApiConfig {
    /// Reads the API settings from the network configuration: a kubeconfig file if one is given, otherwise the
    /// `policy` section.
    pub fn from_network_config(config: &NetworkConfiguration) -> Result<ApiConfig, KubernetesError> {
        if let Some(kubeconfig) = config.kubernetes.as_ref().and_then(|k| k.kubeconfig.as_ref()) {
            return ApiConfig::from_kubeconfig(kubeconfig);
        }

        let mut builder = ApiConfigBuilder::default();
        if let Some(policy) = &config.policy {
            if let Some(root) = &policy.k8s_api_root {
                builder.api_root(root.as_str());
            }
            if let Some(token) = &policy.k8s_auth_token {
                builder.auth_token(token.as_str());
            }
            if let Some(cert) = &policy.k8s_client_certificate {
                builder.client_certificate(cert.as_path());
            }
            if let Some(key) = &policy.k8s_client_key {
                builder.client_key(key.as_path());
            }
            if let Some(ca) = &policy.k8s_certificate_authority {
                builder.certificate_authority(ca.as_path());
            }
        }
        builder.build().map_err(KubernetesError::Config)
    }

    /// Uses the current context of a kubeconfig file. Credentials must be given as file paths; embedded `*-data`
    /// values are not supported.
    pub fn from_kubeconfig(path: &Path) -> Result<ApiConfig, KubernetesError> {
        let contents = fs::read_to_string(path).map_err(|error| KubernetesError::Io {
            path: path.into(),
            error,
        })?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&contents).map_err(|error| KubernetesError::KubeconfigYaml {
            path: path.into(),
            error,
        })?;
        let unusable = |reason: String| KubernetesError::Kubeconfig {
            path: path.into(),
            reason,
        };

        let context = match &kubeconfig.current_context {
            Some(name) => kubeconfig.contexts.iter().find(|c| &c.name == name),
            None => kubeconfig.contexts.first(),
        }
        .ok_or_else(|| unusable("no usable context".into()))?;

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .ok_or_else(|| unusable(format!("cluster {} not found", context.context.cluster)))?;
        let user = match &context.context.user {
            Some(name) => Some(
                kubeconfig
                    .users
                    .iter()
                    .find(|u| &u.name == name)
                    .ok_or_else(|| unusable(format!("user {} not found", name)))?,
            ),
            None => None,
        };

        if cluster.cluster.certificate_authority_data.is_some()
            || user.map_or(false, |u| u.user.client_certificate_data.is_some() || u.user.client_key_data.is_some())
        {
            return Err(unusable("embedded certificate data is not supported, use file paths".into()));
        }

        // Relative paths are relative to the kubeconfig itself.
        let base = path.parent().unwrap_or_else(|| Path::new("/"));
        let resolve = |p: &PathBuf| base.join(p);

        let mut builder = ApiConfigBuilder::default();
        builder.api_root(format!("{}/api/v1/", cluster.cluster.server.trim_end_matches('/')));
        if let Some(ca) = &cluster.cluster.certificate_authority {
            builder.certificate_authority(resolve(ca));
        }
        if let Some(user) = user {
            if let Some(token) = &user.user.token {
                builder.auth_token(token.as_str());
            }
            if let Some(cert) = &user.user.client_certificate {
                builder.client_certificate(resolve(cert));
            }
            if let Some(key) = &user.user.client_key {
                builder.client_key(resolve(key));
            }
        }
        builder.build().map_err(KubernetesError::Config)
    }

    /// Every file the configuration refers to, with the name of the setting it came from.
    pub fn files(&self) -> Vec<(&'static str, &Path)> {
        let mut files = Vec::new();
        if let Some(cert) = &self.client_certificate {
            files.push(("k8s_client_certificate", cert.as_path()));
        }
        if let Some(key) = &self.client_key {
            files.push(("k8s_client_key", key.as_path()));
        }
        if let Some(ca) = &self.certificate_authority {
            files.push(("k8s_certificate_authority", ca.as_path()));
        }
        files
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        let root = self.api_root.trim_end_matches('/');
        format!("{}/namespaces/{}/pods/{}", root, namespace, name)
    }
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,

    #[serde(default)]
    clusters: Vec<NamedCluster>,

    #[serde(default)]
    contexts: Vec<NamedContext>,

    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,

    #[serde(default)]
    certificate_authority: Option<PathBuf>,

    #[serde(default)]
    certificate_authority_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,

    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,

    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,

    #[serde(default)]
    client_certificate: Option<PathBuf>,

    #[serde(default)]
    client_certificate_data: Option<String>,

    #[serde(default)]
    client_key: Option<PathBuf>,

    #[serde(default)]
    client_key_data: Option<String>,
}

/// The parts of a pod this plugin cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Source of pod metadata.
pub trait PodSource {
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubernetesError>;
}

pub struct KubernetesClient {
    config: ApiConfig,
    http: Client,
}

impl KubernetesClient {
    pub fn new(config: ApiConfig) -> Result<KubernetesClient, KubernetesError> {
        let mut builder = Client::builder();

        match &config.certificate_authority {
            Some(ca) => {
                let cert = Certificate::from_pem(&read(ca)?).map_err(|error| KubernetesError::Transport {
                    context: format!("invalid certificate authority {}", ca.display()),
                    error,
                })?;
                builder = builder.add_root_certificate(cert);
            }
            None => {
                debug!("No certificate authority configured, not verifying the API server");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        match (&config.client_certificate, &config.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = read(cert)?;
                pem.extend(read(key)?);
                let identity = Identity::from_pem(&pem).map_err(|error| KubernetesError::Transport {
                    context: format!("invalid client certificate {}", cert.display()),
                    error,
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => (),
            _ => {
                return Err(KubernetesError::Config(
                    "client certificate and key must be configured together".into(),
                ))
            }
        }

        let http = builder.build().map_err(|error| KubernetesError::Transport {
            context: "could not build client".into(),
            error,
        })?;
        Ok(KubernetesClient { config, http })
    }
}

impl PodSource for KubernetesClient {
    #[tracing::instrument(skip(self))]
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubernetesError> {
        let url = self.config.pod_url(namespace, name);
        debug!("Getting pod from {}", url);

        let mut request = self.http.get(&url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(|error| KubernetesError::Transport {
            context: format!("GET {}", url),
            error,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KubernetesError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.text().map_err(|error| KubernetesError::Transport {
            context: format!("reading {}", url),
            error,
        })?;
        serde_json::from_str(&body).map_err(|error| KubernetesError::InvalidPod { url, error })
    }
}

fn read(path: &Path) -> Result<Vec<u8>, KubernetesError> {
    fs::read(path).map_err(|error| KubernetesError::Io {
        path: path.into(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::cni::args::tests::network_config;

    #[test]
    fn test_builder_defaults() {
        let config = ApiConfigBuilder::default().build().unwrap();
        assert_eq!(config.api_root, DEFAULT_API_ROOT);
        assert_eq!(config.auth_token, None);
        assert!(config.files().is_empty());
        assert_eq!(
            config.pod_url("default", "nginx"),
            "https://10.100.0.1:443/api/v1/namespaces/default/pods/nginx"
        );
    }

    #[test]
    fn test_client_certificate_requires_key() {
        let cert_only = ApiConfigBuilder::default().client_certificate("/etc/k8s/client.pem").build().unwrap();
        assert!(matches!(KubernetesClient::new(cert_only), Err(KubernetesError::Config(_))));

        let key_only = ApiConfigBuilder::default().client_key("/etc/k8s/client-key.pem").build().unwrap();
        assert!(matches!(KubernetesClient::new(key_only), Err(KubernetesError::Config(_))));
    }

    #[test]
    fn test_from_policy_section() {
        let config = network_config(json!({
            "name": "net1",
            "type": "calico",
            "ipam": {"type": "calico-ipam"},
            "policy": {
                "type": "k8s",
                "k8s_api_root": "https://kubernetes:6443/api/v1",
                "k8s_auth_token": "secret",
                "k8s_certificate_authority": "/etc/kubernetes/ca.pem"
            }
        }));
        let api = ApiConfig::from_network_config(&config).unwrap();
        assert_eq!(api.auth_token.as_deref(), Some("secret"));
        assert_eq!(api.pod_url("ns", "p"), "https://kubernetes:6443/api/v1/namespaces/ns/pods/p");
        assert_eq!(
            api.files(),
            vec![("k8s_certificate_authority", Path::new("/etc/kubernetes/ca.pem"))]
        );
    }

    #[test]
    fn test_from_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        fs::write(
            &path,
            r#"
apiVersion: v1
kind: Config
current-context: calico
clusters:
- name: local
  cluster:
    server: https://127.0.0.1:6443/
    certificate-authority: ca.pem
contexts:
- name: other
  context:
    cluster: missing
- name: calico
  context:
    cluster: local
    user: cni
users:
- name: cni
  user:
    client-certificate: /etc/cni/cert.pem
    client-key: key.pem
"#,
        )
        .unwrap();

        let api = ApiConfig::from_kubeconfig(&path).unwrap();
        assert_eq!(api.api_root, "https://127.0.0.1:6443/api/v1/");
        assert_eq!(api.certificate_authority, Some(dir.path().join("ca.pem")));
        assert_eq!(api.client_certificate, Some(PathBuf::from("/etc/cni/cert.pem")));
        assert_eq!(api.client_key, Some(dir.path().join("key.pem")));
    }

    #[test]
    fn test_kubeconfig_embedded_data_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        fs::write(
            &path,
            r#"
current-context: c
clusters:
- name: k
  cluster:
    server: https://127.0.0.1:6443
    certificate-authority-data: LS0tLS1CRUdJTg==
contexts:
- name: c
  context:
    cluster: k
"#,
        )
        .unwrap();
        assert!(matches!(
            ApiConfig::from_kubeconfig(&path),
            Err(KubernetesError::Kubeconfig { .. })
        ));
    }

    #[test]
    fn test_pod_metadata() {
        let pod: Pod = serde_json::from_value(json!({
            "kind": "Pod",
            "metadata": {
                "name": "nginx",
                "namespace": "default",
                "labels": {"app": "web"},
                "annotations": {"projectcalico.org/policy": "allow tcp"}
            },
            "spec": {"containers": []}
        }))
        .unwrap();
        assert_eq!(pod.metadata.labels["app"], "web");
        assert_eq!(pod.metadata.annotations["projectcalico.org/policy"], "allow tcp");
    }
}
