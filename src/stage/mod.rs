//! Ephemeral context staging.
//!
//! Build contexts are served to the in-cluster engine over plain HTTP from a
//! throwaway nginx pod. Each build gets a fresh pod and a matching service
//! under a unique name; the pair lives exactly as long as the build that
//! needed it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cluster::{
    Container, ContainerPort, ControlPlane, ObjectMeta, Pod, PodSpec, Service, ServicePort,
    ServiceSpec,
};
use crate::context::PackagedContext;
use crate::error::{ClusterError, StageError};
use crate::util::{random_hex, unix_nanos};

/// Label tying the staging service to its pod.
const STAGE_LABEL: &str = "kiln-stage";
/// Directory nginx serves; uploads land here.
const CONTENT_ROOT: &str = "/usr/share/nginx/html";

#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Image serving the staged context.
    pub image: String,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            image: "nginx:alpine".to_string(),
            poll_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

/// One staging pod/service pair, named uniquely per build.
///
/// Create with [`ContextStage::create`], upload with
/// [`ContextStage::upload`], and always finish with
/// [`ContextStage::delete`]; the stage tracks what it created so teardown
/// only touches resources it owns.
pub struct ContextStage {
    api: Arc<dyn ControlPlane>,
    namespace: String,
    name: String,
    config: StageConfig,
    pod_created: AtomicBool,
    service_created: AtomicBool,
    deleted: AtomicBool,
}

impl ContextStage {
    pub fn new(api: Arc<dyn ControlPlane>, namespace: impl Into<String>, config: StageConfig) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            name: format!("kiln-stage-{}-{}", unix_nanos(), random_hex(2)),
            config,
            pod_created: AtomicBool::new(false),
            service_created: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    /// Host the in-cluster engine fetches the context from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the pod and service, then wait until the pod is running.
    pub async fn create(&self) -> Result<(), StageError> {
        tracing::debug!(stage = %self.name, "creating staging pod and service");

        let labels = HashMap::from([(STAGE_LABEL.to_string(), self.name.clone())]);

        let pod = Pod {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: self.name.clone(),
                labels: labels.clone(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "nginx".to_string(),
                    image: self.config.image.clone(),
                    image_pull_policy: "IfNotPresent".to_string(),
                    ports: vec![ContainerPort { container_port: 80 }],
                }],
            },
            status: None,
        };
        self.api.create_pod(&self.namespace, &pod).await?;
        self.pod_created.store(true, Ordering::SeqCst);

        let service = Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta {
                name: self.name.clone(),
                ..Default::default()
            },
            spec: ServiceSpec {
                ports: vec![ServicePort { port: 80 }],
                selector: labels,
            },
        };
        self.api.create_service(&self.namespace, &service).await?;
        self.service_created.store(true, Ordering::SeqCst);

        self.wait_ready().await
    }

    /// Poll the pod until it runs. Terminal phases and status errors fail
    /// immediately; only Pending-like phases are worth waiting out.
    async fn wait_ready(&self) -> Result<(), StageError> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                let pod = self.api.get_pod(&self.namespace, &self.name).await?;
                match pod.phase() {
                    "Running" => return Ok(()),
                    phase @ ("Succeeded" | "Failed") => {
                        return Err(StageError::Terminal {
                            name: self.name.clone(),
                            phase: phase.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        };

        match tokio::time::timeout(self.config.ready_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(StageError::ReadyTimeout {
                name: self.name.clone(),
                timeout: self.config.ready_timeout,
            }),
        }
    }

    /// Upload a packaged context into the served directory and return the
    /// in-cluster URL it is fetchable from.
    pub async fn upload(&self, context: &PackagedContext) -> Result<String, StageError> {
        let file_name = context.file_name();
        let destination = format!("{CONTENT_ROOT}/{file_name}");

        tracing::debug!(stage = %self.name, %destination, "uploading build context");
        self.api
            .copy_to_pod(&self.namespace, &self.name, context.path(), &destination)
            .await
            .map_err(|e| match e {
                ClusterError::Copy { output } => StageError::Transfer {
                    name: self.name.clone(),
                    output,
                },
                other => StageError::Cluster(other),
            })?;

        Ok(format!("http://{}/{}", self.name, file_name))
    }

    /// Tear down whatever was created. Both resources are attempted even if
    /// the first deletion fails; the first failure is reported.
    pub async fn delete(&self) -> Result<(), StageError> {
        let mut first_failure = None;

        if self.service_created.load(Ordering::SeqCst)
            && let Err(e) = self.api.delete_service(&self.namespace, &self.name).await
        {
            first_failure = Some(e);
        }
        if self.pod_created.load(Ordering::SeqCst)
            && let Err(e) = self.api.delete_pod(&self.namespace, &self.name).await
        {
            first_failure.get_or_insert(e);
        }
        self.deleted.store(true, Ordering::SeqCst);

        match first_failure {
            None => Ok(()),
            Some(e) => Err(StageError::Teardown {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for ContextStage {
    fn drop(&mut self) {
        let created = self.pod_created.load(Ordering::SeqCst)
            || self.service_created.load(Ordering::SeqCst);
        if created && !self.deleted.load(Ordering::SeqCst) {
            tracing::warn!(stage = %self.name, "staging resources were not torn down");
        }
    }
}
