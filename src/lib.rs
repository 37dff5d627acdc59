//! Remote container image builds on a cluster-resident engine.
//!
//! kiln packages a local build context into a digest-named tar.gz archive,
//! stages it inside the cluster behind a throwaway nginx service, submits a
//! `BuildJob` custom resource for the in-cluster engine to execute, streams
//! the build's output while polling for completion, and finally points a
//! content-addressed tag at whatever the engine pushed. Staging resources
//! live exactly as long as the build that needed them.

pub mod build;
pub mod cluster;
pub mod config;
pub mod context;
pub mod digest;
pub mod engine;
pub mod error;
pub mod registry;
pub mod schema;
pub mod stage;
mod util;

pub use build::{BuildResult, BuilderConfig, RemoteBuilder, TaggedBuild};
pub use config::{Artifact, Config};
pub use digest::Digest;
