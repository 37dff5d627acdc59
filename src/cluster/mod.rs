//! Cluster control-plane access.
//!
//! The orchestrator needs a handful of cluster operations: create/get/delete
//! for the staging pod and service, create/get/delete for build jobs, status
//! reads for the batch execution backing a build job, a copy-into-pod
//! primitive, and a continuous log follow. [`ControlPlane`] is the seam;
//! [`HttpControlPlane`] implements it against a real API server.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::ClusterError;
use crate::schema::BuildJob;

mod http;

pub use http::HttpControlPlane;

#[cfg(test)]
pub mod mock;

/// Connection settings for the cluster API server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Base URL of the API server. The default assumes a local
    /// authenticating proxy (`kubectl proxy`).
    pub api_server: String,
    /// Bearer token for direct API server access.
    pub token: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// kubectl binary used for the copy and log-follow primitives.
    pub kubectl: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: "http://127.0.0.1:8001".to_string(),
            token: None,
            insecure: false,
            kubectl: "kubectl".to_string(),
        }
    }
}

/// Minimal object metadata. Deliberately lenient: the server decorates
/// responses with fields this orchestrator never reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pod {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

impl Pod {
    /// Current lifecycle phase, empty until the server reports one.
    pub fn phase(&self) -> &str {
        self.status.as_ref().map(|s| s.phase.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerPort {
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    pub phase: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSpec {
    pub ports: Vec<ServicePort>,
    pub selector: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePort {
    pub port: u16,
}

/// The batch execution backing a build job. Read-only here; its lifecycle
/// belongs to the build engine's controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchJob {
    pub metadata: ObjectMeta,
    pub status: BatchJobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchJobStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<i32>,
}

impl BatchJobStatus {
    /// The controller stamps a completion time once execution stops, whether
    /// it passed or failed.
    pub fn is_complete(&self) -> bool {
        self.completion_time.is_some()
    }

    pub fn has_failures(&self) -> bool {
        self.failed.unwrap_or(0) > 0
    }
}

/// Destination for streamed build output, shared between concurrent writers.
pub type LogSink = Arc<Mutex<dyn AsyncWrite + Send + Unpin>>;

/// Handle to a running log-streaming task.
///
/// The underlying stream does not end on its own when the job finishes, so
/// the owner must call [`LogTask::stop`]. Stop is non-graceful: the reader
/// is terminated immediately rather than drained to end-of-stream.
pub struct LogTask {
    child: Option<tokio::process::Child>,
    task: JoinHandle<()>,
}

impl LogTask {
    /// Wrap a subprocess whose output `task` is pumping into a sink.
    pub fn from_child(child: tokio::process::Child, task: JoinHandle<()>) -> Self {
        Self {
            child: Some(child),
            task,
        }
    }

    /// Wrap a bare streaming task.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self { child: None, task }
    }

    /// Stop streaming, killing the underlying reader.
    pub fn stop(mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.task.abort();
    }
}

/// Copy everything from `reader` into the shared sink.
///
/// The sink lock is held per chunk so concurrent streams interleave at
/// chunk granularity instead of serializing whole runs.
pub(crate) async fn pump_to_sink<R>(mut reader: R, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut out = sink.lock().await;
                if out.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                let _ = out.flush().await;
            }
            Err(_) => break,
        }
    }
}

/// Typed access to the cluster operations the orchestrator needs.
///
/// One instance is shared read-only across all artifacts of a build.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn create_build_job(
        &self,
        namespace: &str,
        job: &BuildJob,
    ) -> Result<BuildJob, ClusterError>;
    async fn get_build_job(&self, namespace: &str, name: &str) -> Result<BuildJob, ClusterError>;
    async fn delete_build_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Status of the batch execution backing a build job.
    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<BatchJob, ClusterError>;

    /// Copy a local file into a pod, then normalize its permissions.
    async fn copy_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), ClusterError>;

    /// Continuously stream a batch job's output into `sink` until the
    /// returned handle is stopped.
    fn follow_job_logs(
        &self,
        namespace: &str,
        job: &str,
        sink: LogSink,
    ) -> Result<LogTask, ClusterError>;
}
