//! CRI runtime client
//!
//! Only `RuntimeService/ContainerStatus` is needed: its verbose info carries
//! the container's init pid, which leads to the container's cgroup. The pid
//! is trusted only while the runtime reports the container as running.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::codegen::http;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Messages of the `runtime.v1` API used by the agent
pub mod runtime_v1 {
    use prost::Message;
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerStatusRequest {
        #[prost(string, tag = "1")]
        pub container_id: String,
        #[prost(bool, tag = "2")]
        pub verbose: bool,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerStatusResponse {
        #[prost(message, optional, tag = "1")]
        pub status: Option<ContainerStatus>,
        #[prost(map = "string, string", tag = "2")]
        pub info: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerStatus {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(enumeration = "ContainerState", tag = "3")]
        pub state: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum ContainerState {
        ContainerCreated = 0,
        ContainerRunning = 1,
        ContainerExited = 2,
        ContainerUnknown = 3,
    }
}

use runtime_v1::{ContainerState, ContainerStatusRequest, ContainerStatusResponse};

const CONTAINER_STATUS_PATH: &str = "/runtime.v1.RuntimeService/ContainerStatus";

/// Resolves container ids to host process ids
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn container_pid(&self, container_id: &str) -> Result<u32>;
}

#[derive(Deserialize)]
struct VerboseInfo {
    #[serde(default)]
    pid: u32,
}

/// Extract the init pid from a verbose ContainerStatus info map
pub fn pid_from_info(info: &HashMap<String, String>) -> Result<u32> {
    let raw = info
        .get("info")
        .ok_or_else(|| AgentError::Runtime("container status has no verbose info".to_string()))?;
    let parsed: VerboseInfo = serde_json::from_str(raw)
        .map_err(|e| AgentError::Runtime(format!("malformed container info: {}", e)))?;
    if parsed.pid == 0 {
        return Err(AgentError::Runtime(
            "pid not found in container info".to_string(),
        ));
    }
    Ok(parsed.pid)
}

/// Init pid of a container the runtime reports as running
pub fn running_pid(response: &ContainerStatusResponse) -> Result<u32> {
    let status = response
        .status
        .as_ref()
        .ok_or_else(|| AgentError::Runtime("container status missing".to_string()))?;
    match status.state() {
        ContainerState::ContainerRunning => pid_from_info(&response.info),
        state => Err(AgentError::Runtime(format!(
            "container {} is not running ({:?})",
            status.id, state
        ))),
    }
}

/// gRPC client dialing the runtime's unix socket
#[derive(Debug, Clone)]
pub struct CriRuntimeClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl CriRuntimeClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<Channel> {
        let path = self.socket_path.clone();
        // The URI is ignored; every connection goes to the socket
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { UnixStream::connect(path).await }
            }))
            .await?;
        Ok(channel)
    }

    pub async fn container_status(&self, container_id: &str) -> Result<ContainerStatusResponse> {
        let channel = self.connect().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| AgentError::Runtime(format!("runtime service not ready: {}", e)))?;

        let request = ContainerStatusRequest {
            container_id: container_id.to_string(),
            verbose: true,
        };
        let codec: tonic::codec::ProstCodec<ContainerStatusRequest, ContainerStatusResponse> =
            tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(CONTAINER_STATUS_PATH);
        let response = grpc
            .unary(tonic::Request::new(request), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl ContainerRuntime for CriRuntimeClient {
    async fn container_pid(&self, container_id: &str) -> Result<u32> {
        let status = self.container_status(container_id).await?;
        let pid = running_pid(&status)?;
        debug!(container_id = %container_id, pid, "Resolved container pid");
        Ok(pid)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Runtime answering from a fixed id -> pid table
    #[derive(Default)]
    pub struct MockRuntime {
        pub pids: Mutex<HashMap<String, u32>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        pub fn with_pids(pids: &[(&str, u32)]) -> Self {
            Self {
                pids: Mutex::new(pids.iter().map(|(id, pid)| (id.to_string(), *pid)).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn container_pid(&self, container_id: &str) -> Result<u32> {
            self.calls.lock().unwrap().push(container_id.to_string());
            self.pids
                .lock()
                .unwrap()
                .get(container_id)
                .copied()
                .ok_or_else(|| AgentError::Runtime(format!("unknown container {}", container_id)))
        }
    }
}
