//! Build job supervision.
//!
//! Submits a fulfilled build job to the in-cluster engine, waits for its
//! controller to schedule a backing batch job, streams that job's output,
//! and polls the batch status until the build completes. The build job
//! resource itself is deleted on the way out; the batch job belongs to the
//! controller and is left for it to reclaim.

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{BatchJobStatus, ControlPlane, LogSink};
use crate::error::EngineError;
use crate::schema::BuildJob;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// How long the controller gets to schedule a batch job.
    pub ready_timeout: Duration,
    /// How long the build itself gets to finish.
    pub completion_timeout: Duration,
    /// Delay between scheduling and log attachment.
    pub log_warmup: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(180),
            completion_timeout: Duration::from_secs(3600),
            log_warmup: Duration::from_secs(10),
        }
    }
}

/// Supervises one submitted build job through to completion.
pub struct JobMonitor {
    api: Arc<dyn ControlPlane>,
    namespace: String,
    config: EngineConfig,
}

impl JobMonitor {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        namespace: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            config,
        }
    }

    /// Submit `job` and supervise it to completion, streaming build output
    /// into `sink`. The submitted resource is deleted afterwards regardless
    /// of outcome; a failed deletion only warns.
    pub async fn run(&self, job: BuildJob, sink: LogSink) -> Result<BatchJobStatus, EngineError> {
        let name = job.metadata.name.clone();
        tracing::info!(job = %name, target = %job.spec.registry.target, "submitting build job");

        self.api
            .create_build_job(&self.namespace, &job)
            .await
            .map_err(EngineError::Submission)?;

        let result = self.supervise(&name, sink).await;

        if let Err(e) = self.api.delete_build_job(&self.namespace, &name).await {
            tracing::warn!(job = %name, error = %e, "failed to delete build job");
        }
        result
    }

    async fn supervise(&self, name: &str, sink: LogSink) -> Result<BatchJobStatus, EngineError> {
        let batch_job = self.wait_scheduled(name).await?;
        tracing::debug!(job = %name, batch_job = %batch_job, "build scheduled");

        // The batch pod takes a moment to exist after scheduling, and
        // following logs before then fails outright.
        // TODO: replace this fixed delay with a watch on the batch pod once
        // the engine exposes its name in the build job status.
        tokio::time::sleep(self.config.log_warmup).await;

        let logs = self
            .api
            .follow_job_logs(&self.namespace, &batch_job, sink)
            .map_err(EngineError::Logs)?;

        let result = self.wait_complete(name, &batch_job).await;
        logs.stop();
        result
    }

    /// Poll the build job until its controller reports a backing batch job.
    async fn wait_scheduled(&self, name: &str) -> Result<String, EngineError> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                let job = self
                    .api
                    .get_build_job(&self.namespace, name)
                    .await
                    .map_err(EngineError::Status)?;
                if let Some(status) = &job.status
                    && !status.job.is_empty()
                {
                    return Ok(status.job.clone());
                }
            }
        };

        match tokio::time::timeout(self.config.ready_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ReadyTimeout {
                name: name.to_string(),
                timeout: self.config.ready_timeout,
            }),
        }
    }

    /// Poll the batch job until it stamps a completion time, then judge the
    /// outcome by its failure count.
    async fn wait_complete(
        &self,
        name: &str,
        batch_job: &str,
    ) -> Result<BatchJobStatus, EngineError> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                let job = self
                    .api
                    .get_batch_job(&self.namespace, batch_job)
                    .await
                    .map_err(EngineError::Status)?;
                if job.status.is_complete() {
                    if job.status.has_failures() {
                        return Err(EngineError::Failed {
                            name: name.to_string(),
                            status: job.status,
                        });
                    }
                    return Ok(job.status);
                }
            }
        };

        match tokio::time::timeout(self.config.completion_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::CompletionTimeout {
                name: name.to_string(),
                timeout: self.config.completion_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    use super::*;
    use crate::cluster::mock::MockControlPlane;

    fn monitor(mock: &Arc<MockControlPlane>) -> JobMonitor {
        JobMonitor::new(mock.clone(), "default", EngineConfig::default())
    }

    fn job(name: &str) -> BuildJob {
        let mut job = BuildJob::default().fulfill("app:abc", "http://stage/ctx.tar.gz");
        job.metadata.name = name.to_string();
        job
    }

    fn sink() -> (Arc<Mutex<Vec<u8>>>, LogSink) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink: LogSink = buffer.clone();
        (buffer, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_build_streams_and_cleans_up() {
        let mock = Arc::new(MockControlPlane::new());
        mock.script_backing_job(None);
        mock.script_backing_job(Some("builder-1"));
        mock.script_batch_status(BatchJobStatus::default());
        mock.script_batch_status(MockControlPlane::completed(0));
        let (buffer, sink) = sink();

        let status = monitor(&mock).run(job("build-1"), sink).await.unwrap();
        assert!(status.is_complete());

        assert_eq!(mock.count("get_build_job"), 2);
        assert_eq!(mock.count("get_batch_job"), 2);
        assert_eq!(mock.count("delete_build_job"), 1);
        assert!(mock.operations().contains(&"follow_logs job/builder-1".to_string()));
        assert_eq!(*buffer.lock().await, b"building builder-1\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_build_reports_status() {
        let mock = Arc::new(MockControlPlane::new());
        mock.script_backing_job(Some("builder-1"));
        mock.script_batch_status(MockControlPlane::completed(2));
        let (_buffer, sink) = sink();

        let err = monitor(&mock).run(job("build-1"), sink).await.unwrap_err();
        assert!(matches!(
            &err,
            EngineError::Failed { name, status }
                if name == "build-1" && status.failed == Some(2)
        ));
        assert_eq!(mock.count("delete_build_job"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_scheduled_times_out() {
        let mock = Arc::new(MockControlPlane::new());
        let (_buffer, sink) = sink();

        let err = monitor(&mock).run(job("build-1"), sink).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ReadyTimeout { timeout, .. } if timeout == Duration::from_secs(180)
        ));
        assert_eq!(mock.count("follow_logs"), 0);
        assert_eq!(mock.count("delete_build_job"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_completing_build_times_out() {
        let mock = Arc::new(MockControlPlane::new());
        mock.script_backing_job(Some("builder-1"));
        let (_buffer, sink) = sink();

        let err = monitor(&mock).run(job("build-1"), sink).await.unwrap_err();
        assert!(matches!(err, EngineError::CompletionTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_failure_skips_supervision() {
        let mock = Arc::new(MockControlPlane::new());
        mock.fail("create_build_job");
        let (_buffer, sink) = sink();

        let err = monitor(&mock).run(job("build-1"), sink).await.unwrap_err();
        assert!(matches!(err, EngineError::Submission(_)));
        assert_eq!(mock.count("get_build_job"), 0);
        assert_eq!(mock.count("delete_build_job"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_errors_fail_fast() {
        let mock = Arc::new(MockControlPlane::new());
        mock.fail("get_build_job");
        let (_buffer, sink) = sink();

        let err = monitor(&mock).run(job("build-1"), sink).await.unwrap_err();
        assert!(matches!(err, EngineError::Status(_)));
        assert_eq!(mock.count("get_build_job"), 1);
        assert_eq!(mock.count("delete_build_job"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_failure_does_not_mask_success() {
        let mock = Arc::new(MockControlPlane::new());
        mock.ready_immediately();
        mock.fail("delete_build_job");
        let (_buffer, sink) = sink();

        let status = monitor(&mock).run(job("build-1"), sink).await.unwrap();
        assert!(status.is_complete());
        assert_eq!(mock.count("delete_build_job"), 1);
    }
}
