//! Container engines, consulted to skip containers that share the host's network namespace.

use std::path::PathBuf;

use http::StatusCode;
use hyper::body::{Body, Buf};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Docker Engine API socket.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

const HOST_NETWORK_MODE: &str = "host";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not start container engine client")]
    Runtime(#[source] std::io::Error),

    #[error("HTTP transport error")]
    Transport(#[from] hyper::Error),

    #[error("invalid JSON")]
    InvalidJson(#[from] serde_json::Error),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("unexpected HTTP response: {0}")]
    UnexpectedResponse(StatusCode),
}

pub trait ContainerEngine {
    fn uses_host_networking(&self, container_id: &str) -> Result<bool, EngineError>;
}

/// Runtimes that never call the plugin for host-networked containers.
#[derive(Debug, Default)]
pub struct DefaultEngine;

impl ContainerEngine for DefaultEngine {
    fn uses_host_networking(&self, _container_id: &str) -> Result<bool, EngineError> {
        Ok(false)
    }
}

/// Asks the Docker daemon how the container's network is set up.
pub struct DockerEngine {
    socket_path: PathBuf,
    inner: hyper::Client<UnixConnector, Body>,
}

impl DockerEngine {
    pub fn new<P: Into<PathBuf>>(socket_path: P) -> DockerEngine {
        DockerEngine {
            socket_path: socket_path.into(),
            inner: hyper::Client::unix(),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        let request = self
            .builder_for(&format!("/containers/{}/json", container_id))
            .method("GET")
            .body(Body::default())
            .expect("malformed request");
        let response = self.inner.request(request).await?;
        match response.status() {
            StatusCode::OK => deserialize_json(response).await,
            StatusCode::NOT_FOUND => Err(EngineError::NotFound(container_id.into())),
            status => Err(EngineError::UnexpectedResponse(status)),
        }
    }

    fn builder_for(&self, path: &str) -> http::request::Builder {
        http::Request::builder()
            .uri(hyper::Uri::from(Uri::new(&self.socket_path, path)))
            .header(http::header::ACCEPT, "application/json")
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        DockerEngine::new(DOCKER_SOCKET)
    }
}

impl ContainerEngine for DockerEngine {
    #[tracing::instrument(skip(self))]
    fn uses_host_networking(&self, container_id: &str) -> Result<bool, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;
        let info = runtime.block_on(self.inspect(container_id))?;
        debug!("Container {} has network mode {:?}", container_id, info.host_config.network_mode);
        Ok(info.uses_host_networking())
    }
}

/// Deserializes the HTTP response body as JSON
async fn deserialize_json<D: serde::de::DeserializeOwned>(response: hyper::Response<Body>) -> Result<D, EngineError> {
    let body = hyper::body::aggregate(response).await?;
    Ok(serde_json::from_reader(body.reader())?)
}

/// The part of `GET /containers/{id}/json` we care about.
#[derive(Debug, Default, Deserialize)]
struct ContainerInfo {
    #[serde(rename = "HostConfig", default)]
    host_config: HostConfig,
}

#[derive(Debug, Default, Deserialize)]
struct HostConfig {
    #[serde(rename = "NetworkMode", default)]
    network_mode: Option<String>,
}

impl ContainerInfo {
    fn uses_host_networking(&self) -> bool {
        self.host_config.network_mode.as_deref() == Some(HOST_NETWORK_MODE)
    }
}
