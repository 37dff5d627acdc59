//! Error types for the build orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::BatchJobStatus;

/// Errors from loading or validating build configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    /// The build job template declares a schema version this orchestrator
    /// does not support.
    #[error("unsupported build job apiVersion: {found:?}")]
    UnsupportedApiVersion { found: String },

    /// The build job template does not match the declared schema.
    #[error("malformed build job template: {reason}")]
    MalformedTemplate { reason: String },
}

/// Errors from packaging a workspace into a context archive.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Workspace directory missing or unreadable.
    #[error("workspace {} is not accessible: {reason}", .path.display())]
    Workspace { path: PathBuf, reason: String },

    /// A file could not be added to the archive.
    #[error("failed to archive {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },

    /// The blocking packaging task died before finishing.
    #[error("packaging task failed: {reason}")]
    Worker { reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from talking to the cluster control plane.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The API server rejected the request.
    #[error("{operation} failed: HTTP {status}: {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    /// The request never reached the API server.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API server's response did not match the expected shape.
    #[error("invalid response for {operation}: {reason}")]
    Decode { operation: String, reason: String },

    /// Copying a file into a pod failed; carries the captured output of the
    /// copy and permission-fix commands.
    #[error("copy into pod failed: {output}")]
    Copy { output: String },

    /// An external command could not be run at all.
    #[error("failed to run {command}: {reason}")]
    Subprocess { command: String, reason: String },
}

/// Errors from the ephemeral context staging server.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Control-plane call failed.
    #[error("cluster API error: {0}")]
    Cluster(#[from] ClusterError),

    /// The staging pod reached a terminal phase before it ever served.
    #[error("staging server {name} entered phase {phase} before becoming ready")]
    Terminal { name: String, phase: String },

    /// The staging pod did not become ready within the bound.
    #[error("staging server {name} not ready after {timeout:?}")]
    ReadyTimeout { name: String, timeout: Duration },

    /// Context upload failed; carries the captured command output.
    #[error("context transfer to {name} failed: {output}")]
    Transfer { name: String, output: String },

    /// Teardown left resources behind.
    #[error("staging teardown for {name} incomplete: {reason}")]
    Teardown { name: String, reason: String },
}

/// Errors from submitting and supervising a build job.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The control plane rejected the build job.
    #[error("build job submission rejected: {0}")]
    Submission(#[source] ClusterError),

    /// A status fetch failed during polling. Polling does not retry after
    /// this; control-plane unavailability fails the build immediately.
    #[error("failed to fetch build status: {0}")]
    Status(#[source] ClusterError),

    /// The engine never accepted the job within the bound.
    #[error("build job {name} not accepted after {timeout:?}")]
    ReadyTimeout { name: String, timeout: Duration },

    /// The job did not finish within the bound.
    #[error("build job {name} did not complete within {timeout:?}")]
    CompletionTimeout { name: String, timeout: Duration },

    /// The job finished with failures; carries the final status snapshot.
    #[error("build job {name} failed: {status:?}")]
    Failed { name: String, status: BatchJobStatus },

    /// Log streaming could not be started.
    #[error("log streaming failed: {0}")]
    Logs(#[source] ClusterError),
}

/// Errors from resolving or tagging built images.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The image reference string could not be parsed.
    #[error("invalid image reference {reference:?}: {reason}")]
    Reference { reference: String, reason: String },

    /// A digest string was not of the form `algorithm:encoded`.
    #[error("malformed digest {value:?}")]
    MalformedDigest { value: String },

    /// The registry could not report a digest for the reference.
    #[error("failed to resolve digest for {reference}: {reason}")]
    Digest { reference: String, reason: String },

    /// Adding the tag to the registry failed.
    #[error("failed to tag {reference} as {target}: {reason}")]
    Tag {
        reference: String,
        target: String,
        reason: String,
    },

    /// The tagging policy could not produce a name.
    #[error("tag policy failed for {image}: {reason}")]
    Policy { image: String, reason: String },
}

/// Top-level build failure, naming the image the failing step was
/// working on. The first failing artifact aborts the whole build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Invalid configuration, detected before any cluster resources are
    /// created.
    #[error("invalid build configuration: {0}")]
    Config(#[from] ConfigError),

    /// Context packaging failed.
    #[error("packaging context for {image}: {source}")]
    Package {
        image: String,
        #[source]
        source: PackageError,
    },

    /// Staging the context in-cluster failed.
    #[error("staging context for {image}: {source}")]
    Stage {
        image: String,
        #[source]
        source: StageError,
    },

    /// The build job itself failed.
    #[error("building {image}: {source}")]
    Engine {
        image: String,
        #[source]
        source: EngineError,
    },

    /// The built image could not be resolved or tagged.
    #[error("resolving built image {image}: {source}")]
    Resolve {
        image: String,
        #[source]
        source: ResolveError,
    },
}
