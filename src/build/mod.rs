//! Remote build orchestration.
//!
//! [`RemoteBuilder`] runs the whole flow for each artifact in turn: package
//! the context, stage it in-cluster, submit a build job, stream its output,
//! then resolve what the engine pushed and stamp the final tag on it.
//! Artifacts build sequentially and the first failure aborts the run with
//! nothing reported built.

use std::path::Path;
use std::sync::Arc;

use crate::cluster::{ControlPlane, LogSink};
use crate::config::Artifact;
use crate::context::{BuildContext, DependencySource, WorkspaceWalker, package};
use crate::digest::Digest;
use crate::engine::{EngineConfig, JobMonitor};
use crate::error::{BuildError, ResolveError};
use crate::registry::ImageRegistry;
use crate::schema::BuildJobTemplate;
use crate::stage::{ContextStage, StageConfig};
use crate::util::random_hex;

/// Inputs a tagging policy may draw on.
pub struct TagRequest {
    pub image_name: String,
    /// Digest of the manifest the engine pushed.
    pub digest: Digest,
}

/// Policy producing the final, fully qualified name for a built image.
pub trait Tagger: Send + Sync {
    fn fully_qualified_name(
        &self,
        workspace: &Path,
        request: &TagRequest,
    ) -> Result<String, ResolveError>;
}

/// Tags images by the content digest of what was actually pushed, so the
/// same context always yields the same name.
pub struct ContentTagger;

impl Tagger for ContentTagger {
    fn fully_qualified_name(
        &self,
        _workspace: &Path,
        request: &TagRequest,
    ) -> Result<String, ResolveError> {
        Ok(format!(
            "{}:{}-{}",
            request.image_name,
            request.digest.algorithm(),
            request.digest.encoded()
        ))
    }
}

/// One successfully built and tagged image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedBuild {
    pub image_name: String,
    /// Fully qualified name the image is pullable by.
    pub tag: String,
    /// The artifact this build came from.
    pub artifact: Artifact,
}

#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub builds: Vec<TaggedBuild>,
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub namespace: String,
    pub stage: StageConfig,
    pub engine: EngineConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            stage: StageConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Orchestrates remote builds against one cluster and one registry.
pub struct RemoteBuilder {
    api: Arc<dyn ControlPlane>,
    registry: Arc<dyn ImageRegistry>,
    tagger: Box<dyn Tagger>,
    dependencies: Box<dyn DependencySource>,
    template: serde_yaml::Value,
    config: BuilderConfig,
}

impl RemoteBuilder {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        registry: Arc<dyn ImageRegistry>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            api,
            registry,
            tagger: Box::new(ContentTagger),
            dependencies: Box::new(WorkspaceWalker),
            template: serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
            config,
        }
    }

    /// Use a partial build job as the base of every submission.
    pub fn with_template(mut self, template: serde_yaml::Value) -> Self {
        self.template = template;
        self
    }

    pub fn with_tagger(mut self, tagger: Box<dyn Tagger>) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Box<dyn DependencySource>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Build every artifact, streaming build output into `sink`. Results
    /// come back only if every artifact built; the first failure aborts.
    pub async fn build(
        &self,
        sink: LogSink,
        artifacts: &[Artifact],
    ) -> Result<BuildResult, BuildError> {
        let template = BuildJobTemplate::from_value(&self.template)?;
        tracing::info!(
            version = template.api_version(),
            artifacts = artifacts.len(),
            "starting remote builds"
        );

        let monitor = JobMonitor::new(
            self.api.clone(),
            &self.config.namespace,
            self.config.engine.clone(),
        );

        let mut builds = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            builds.push(
                self.build_artifact(&template, &monitor, artifact, sink.clone())
                    .await?,
            );
        }
        Ok(BuildResult { builds })
    }

    /// Run one artifact against a fresh staging pair, tearing the pair down
    /// no matter how the build went.
    async fn build_artifact(
        &self,
        template: &BuildJobTemplate,
        monitor: &JobMonitor,
        artifact: &Artifact,
        sink: LogSink,
    ) -> Result<TaggedBuild, BuildError> {
        tracing::info!(
            image = %artifact.image_name,
            workspace = %artifact.workspace.display(),
            "building artifact"
        );

        let stage = ContextStage::new(
            self.api.clone(),
            &self.config.namespace,
            self.config.stage.clone(),
        );

        let result = self
            .run_build(&stage, template, monitor, artifact, sink)
            .await;

        if let Err(e) = stage.delete().await {
            tracing::warn!(
                image = %artifact.image_name,
                error = %e,
                "failed to tear down staging resources"
            );
        }
        result
    }

    async fn run_build(
        &self,
        stage: &ContextStage,
        template: &BuildJobTemplate,
        monitor: &JobMonitor,
        artifact: &Artifact,
        sink: LogSink,
    ) -> Result<TaggedBuild, BuildError> {
        let image = &artifact.image_name;
        let package_failed = |source| BuildError::Package {
            image: image.clone(),
            source,
        };
        let stage_failed = |source| BuildError::Stage {
            image: image.clone(),
            source,
        };
        let resolve_failed = |source| BuildError::Resolve {
            image: image.clone(),
            source,
        };

        let context = BuildContext {
            workspace: artifact.workspace.clone(),
            dockerfile: Some(artifact.dockerfile.clone()),
            files: Some(self.dependencies.dependencies(artifact).map_err(package_failed)?),
        };

        // Packaging is pure CPU and disk; overlap it with waiting for the
        // staging pod to come up.
        let (_, packaged) = tokio::try_join!(
            async { stage.create().await.map_err(stage_failed) },
            async { package(context).await.map_err(package_failed) },
        )?;

        let context_url = stage.upload(&packaged).await.map_err(stage_failed)?;
        tracing::debug!(image = %image, url = %context_url, "context staged");

        // The engine needs somewhere to push before the final name is
        // knowable, so the job targets a throwaway tag.
        let ephemeral = format!("{image}:{}", random_hex(32));
        let job = template
            .clone()
            .fulfill(&ephemeral, &context_url)
            .into_build_job();
        monitor.run(job, sink).await.map_err(|source| BuildError::Engine {
            image: image.clone(),
            source,
        })?;

        let digest = self
            .registry
            .remote_digest(&ephemeral)
            .await
            .map_err(resolve_failed)?;
        tracing::info!(image = %image, digest = %digest, "build pushed");

        let request = TagRequest {
            image_name: image.clone(),
            digest,
        };
        let tag = self
            .tagger
            .fully_qualified_name(&artifact.workspace, &request)
            .map_err(resolve_failed)?;
        self.registry
            .tag(&ephemeral, &tag)
            .await
            .map_err(resolve_failed)?;
        tracing::info!(image = %image, tag = %tag, "tagged");

        Ok(TaggedBuild {
            image_name: image.clone(),
            tag,
            artifact: artifact.clone(),
        })
    }
}
