//! Scriptable in-memory control plane for tests.
//!
//! Every call is appended to an operation log that tests assert against.
//! Poll responses come from per-resource scripts: queued values are consumed
//! in order and the final one repeats, so a test can express "Pending, then
//! Running" or "never ready" in one or two lines.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::cluster::{
    BatchJob, BatchJobStatus, ControlPlane, LogSink, LogTask, ObjectMeta, Pod, PodStatus, Service,
};
use crate::error::ClusterError;
use crate::schema::{BuildJob, BuildJobStatus};

#[derive(Default)]
pub struct MockControlPlane {
    ops: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    pod_phases: Mutex<VecDeque<String>>,
    backing_jobs: Mutex<VecDeque<Option<String>>>,
    batch_statuses: Mutex<VecDeque<BatchJobStatus>>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail with an injected API error.
    pub fn fail(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    /// Queue the phase reported by the next pod status poll.
    pub fn script_pod_phase(&self, phase: &str) {
        self.pod_phases
            .lock()
            .unwrap()
            .push_back(phase.to_string());
    }

    /// Queue the backing batch job reported by the next build job poll.
    pub fn script_backing_job(&self, job: Option<&str>) {
        self.backing_jobs
            .lock()
            .unwrap()
            .push_back(job.map(str::to_string));
    }

    /// Queue the status reported by the next batch job poll.
    pub fn script_batch_status(&self, status: BatchJobStatus) {
        self.batch_statuses.lock().unwrap().push_back(status);
    }

    /// Script the happy path: the stage pod runs at once and the batch job
    /// completes cleanly on its first poll.
    pub fn ready_immediately(&self) {
        self.script_pod_phase("Running");
        self.script_backing_job(Some("builder-1"));
        self.script_batch_status(Self::completed(0));
    }

    /// A finished batch status with the given number of failed attempts.
    pub fn completed(failed: i32) -> BatchJobStatus {
        BatchJobStatus {
            completion_time: Some(Utc::now()),
            succeeded: if failed > 0 { None } else { Some(1) },
            failed: if failed > 0 { Some(failed) } else { None },
            ..Default::default()
        }
    }

    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    /// Record the attempt, then fail if the operation was marked failing.
    fn record(&self, operation: &str, detail: String) -> Result<(), ClusterError> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("{operation} {detail}"));
        if self.failing.lock().unwrap().contains(operation) {
            return Err(injected(operation));
        }
        Ok(())
    }

    fn next<T: Clone>(queue: &Mutex<VecDeque<T>>, fallback: T) -> T {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(fallback)
        } else {
            queue.front().cloned().unwrap_or(fallback)
        }
    }
}

fn injected(operation: &str) -> ClusterError {
    ClusterError::Api {
        operation: operation.to_string(),
        status: 500,
        body: "injected failure".to_string(),
    }
}

fn named(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: name.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        self.record("create_pod", pod.metadata.name.clone())?;
        Ok(pod.clone())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.record("get_pod", name.to_string())?;
        let phase = Self::next(&self.pod_phases, "Pending".to_string());
        Ok(Pod {
            metadata: named(name),
            status: Some(PodStatus { phase }),
            ..Default::default()
        })
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record("delete_pod", name.to_string())
    }

    async fn create_service(
        &self,
        _namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        self.record("create_service", service.metadata.name.clone())?;
        Ok(service.clone())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record("delete_service", name.to_string())
    }

    async fn create_build_job(
        &self,
        _namespace: &str,
        job: &BuildJob,
    ) -> Result<BuildJob, ClusterError> {
        let context = job
            .spec
            .context
            .http
            .as_ref()
            .map(|http| http.url.as_str())
            .unwrap_or("-");
        self.record(
            "create_build_job",
            format!(
                "{} target={} context={}",
                job.metadata.name, job.spec.registry.target, context
            ),
        )?;
        Ok(job.clone())
    }

    async fn get_build_job(&self, _namespace: &str, name: &str) -> Result<BuildJob, ClusterError> {
        self.record("get_build_job", name.to_string())?;
        let backing = Self::next(&self.backing_jobs, None);
        let mut job = BuildJob::default();
        job.metadata = named(name);
        job.status = backing.map(|job| BuildJobStatus { job });
        Ok(job)
    }

    async fn delete_build_job(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record("delete_build_job", name.to_string())
    }

    async fn get_batch_job(&self, _namespace: &str, name: &str) -> Result<BatchJob, ClusterError> {
        self.record("get_batch_job", name.to_string())?;
        Ok(BatchJob {
            metadata: named(name),
            status: Self::next(&self.batch_statuses, BatchJobStatus::default()),
        })
    }

    async fn copy_to_pod(
        &self,
        _namespace: &str,
        pod: &str,
        _local: &Path,
        remote: &str,
    ) -> Result<(), ClusterError> {
        self.record("copy_to_pod", format!("{pod} {remote}"))
    }

    fn follow_job_logs(
        &self,
        _namespace: &str,
        job: &str,
        sink: LogSink,
    ) -> Result<LogTask, ClusterError> {
        self.record("follow_logs", format!("job/{job}"))?;
        let line = format!("building {job}\n");
        let task = tokio::spawn(async move {
            {
                let mut sink = sink.lock().await;
                let _ = sink.write_all(line.as_bytes()).await;
                let _ = sink.flush().await;
            }
            std::future::pending::<()>().await
        });
        Ok(LogTask::from_task(task))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_scripts_consume_then_repeat_last() {
        let mock = MockControlPlane::new();
        mock.script_pod_phase("Pending");
        mock.script_pod_phase("Running");

        let first = mock.get_pod("default", "stage").await.unwrap();
        let second = mock.get_pod("default", "stage").await.unwrap();
        let third = mock.get_pod("default", "stage").await.unwrap();
        assert_eq!(first.phase(), "Pending");
        assert_eq!(second.phase(), "Running");
        assert_eq!(third.phase(), "Running");
    }

    #[tokio::test]
    async fn test_unscripted_polls_fall_back() {
        let mock = MockControlPlane::new();
        let pod = mock.get_pod("default", "stage").await.unwrap();
        assert_eq!(pod.phase(), "Pending");

        let job = mock.get_build_job("default", "build").await.unwrap();
        assert!(job.status.is_none());

        let batch = mock.get_batch_job("default", "builder-1").await.unwrap();
        assert!(!batch.status.is_complete());
    }

    #[tokio::test]
    async fn test_failing_operation_is_still_recorded() {
        let mock = MockControlPlane::new();
        mock.fail("delete_service");

        let err = mock.delete_service("default", "stage").await.unwrap_err();
        assert!(matches!(err, ClusterError::Api { status: 500, .. }));
        assert_eq!(mock.count("delete_service"), 1);
    }

    #[tokio::test]
    async fn test_follow_logs_writes_into_sink() {
        let mock = MockControlPlane::new();
        let buffer = Arc::new(tokio::sync::Mutex::new(Vec::<u8>::new()));
        let sink: LogSink = buffer.clone();

        let task = mock.follow_job_logs("default", "builder-1", sink).unwrap();
        tokio::task::yield_now().await;
        task.stop();

        assert_eq!(*buffer.lock().await, b"building builder-1\n");
    }
}
