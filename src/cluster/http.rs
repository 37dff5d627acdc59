//! HTTP control-plane client.
//!
//! A thin JSON client against the cluster API server. The copy-into-pod and
//! log-follow primitives shell out to kubectl instead: both ride protocol
//! upgrades (exec streaming, chunked follow) that are not worth
//! reimplementing for two call sites.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;

use crate::cluster::{
    BatchJob, ClusterConfig, ControlPlane, LogSink, LogTask, Pod, Service, pump_to_sink,
};
use crate::error::ClusterError;
use crate::schema::{API_VERSION_V1ALPHA1, BuildJob};

/// Control plane implementation over the cluster's REST API.
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: Option<String>,
    kubectl: String,
}

impl HttpControlPlane {
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: config.api_server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            kubectl: config.kubectl.clone(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.client.request(method, self.api_url(path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Send a request, surfacing the response body on non-success statuses.
    async fn send_raw(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<String, ClusterError> {
        tracing::trace!(operation, "cluster API request");

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ClusterError::Api {
                operation: operation.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn send<R: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<R, ClusterError> {
        let body = self.send_raw(operation, request).await?;
        serde_json::from_str(&body).map_err(|e| ClusterError::Decode {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }

    async fn create<T: Serialize + Sync, R: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        resource: &T,
    ) -> Result<R, ClusterError> {
        self.send(operation, self.request(Method::POST, path).json(resource))
            .await
    }

    async fn get<R: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<R, ClusterError> {
        self.send(operation, self.request(Method::GET, path)).await
    }

    async fn delete(&self, operation: &str, path: &str) -> Result<(), ClusterError> {
        self.send_raw(operation, self.request(Method::DELETE, path))
            .await
            .map(|_| ())
    }

    /// Run one kubectl command of the copy sequence, capturing combined
    /// output. Failures carry that output for diagnosis.
    async fn copy_command(&self, args: &[&str]) -> Result<(), ClusterError> {
        let output = Command::new(&self.kubectl)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ClusterError::Subprocess {
                command: format!("{} {}", self.kubectl, args.join(" ")),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ClusterError::Copy {
                output: combined_output(&output),
            });
        }
        Ok(())
    }

    fn buildjobs_path(&self, namespace: &str) -> String {
        format!("apis/{API_VERSION_V1ALPHA1}/namespaces/{namespace}/buildjobs")
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        self.create(
            "create pod",
            &format!("api/v1/namespaces/{namespace}/pods"),
            pod,
        )
        .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.get(
            "get pod",
            &format!("api/v1/namespaces/{namespace}/pods/{name}"),
        )
        .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete(
            "delete pod",
            &format!("api/v1/namespaces/{namespace}/pods/{name}"),
        )
        .await
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        self.create(
            "create service",
            &format!("api/v1/namespaces/{namespace}/services"),
            service,
        )
        .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete(
            "delete service",
            &format!("api/v1/namespaces/{namespace}/services/{name}"),
        )
        .await
    }

    async fn create_build_job(
        &self,
        namespace: &str,
        job: &BuildJob,
    ) -> Result<BuildJob, ClusterError> {
        self.create("create build job", &self.buildjobs_path(namespace), job)
            .await
    }

    async fn get_build_job(&self, namespace: &str, name: &str) -> Result<BuildJob, ClusterError> {
        self.get(
            "get build job",
            &format!("{}/{name}", self.buildjobs_path(namespace)),
        )
        .await
    }

    async fn delete_build_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete(
            "delete build job",
            &format!("{}/{name}", self.buildjobs_path(namespace)),
        )
        .await
    }

    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<BatchJob, ClusterError> {
        self.get(
            "get batch job",
            &format!("apis/batch/v1/namespaces/{namespace}/jobs/{name}"),
        )
        .await
    }

    async fn copy_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), ClusterError> {
        let local = local.to_string_lossy();
        let target = format!("{namespace}/{pod}:{remote}");
        self.copy_command(&["cp", &local, &target]).await?;
        self.copy_command(&[
            "--namespace",
            namespace,
            "exec",
            pod,
            "--",
            "chmod",
            "0644",
            remote,
        ])
        .await
    }

    fn follow_job_logs(
        &self,
        namespace: &str,
        job: &str,
        sink: LogSink,
    ) -> Result<LogTask, ClusterError> {
        let mut child = Command::new(&self.kubectl)
            .args(["--namespace", namespace, "logs", "--follow"])
            .arg(format!("job/{job}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::Subprocess {
                command: format!("{} logs --follow job/{job}", self.kubectl),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let task = tokio::spawn(async move {
            match (stdout, stderr) {
                (Some(out), Some(err)) => {
                    tokio::join!(pump_to_sink(out, sink.clone()), pump_to_sink(err, sink));
                }
                (Some(out), None) => pump_to_sink(out, sink).await,
                (None, Some(err)) => pump_to_sink(err, sink).await,
                (None, None) => {}
            }
        });

        Ok(LogTask::from_child(child, task))
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}").trim().to_string()
}
