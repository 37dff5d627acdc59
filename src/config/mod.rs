//! Configuration file model.
//!
//! Parsing is strict everywhere: an unknown key anywhere in the file is a
//! parse error, not a silently ignored setting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::build::BuilderConfig;
use crate::cluster::ClusterConfig;
use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::registry::RegistryConfig;
use crate::stage::StageConfig;

/// One image to build: where its context lives and what to call it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Artifact {
    pub image_name: String,
    /// Workspace root the build context is packaged from.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Build instruction file, relative to the workspace.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    /// Namespace the staging resources and build jobs are created in.
    pub namespace: String,
    pub cluster: ClusterConfig,
    pub registry: RegistryConfig,
    pub artifacts: Vec<Artifact>,
    /// Partial build job merged into every submission.
    pub build_job_template: Option<serde_yaml::Value>,
    /// Image serving staged contexts, when the default is unreachable.
    pub stage_image: Option<String>,
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            cluster: ClusterConfig::default(),
            registry: RegistryConfig::default(),
            artifacts: Vec::new(),
            build_job_template: None,
            stage_image: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Optional overrides for the orchestrator's poll loops.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub poll_interval_ms: Option<u64>,
    pub stage_ready_secs: Option<u64>,
    pub build_ready_secs: Option<u64>,
    pub build_completion_secs: Option<u64>,
    pub log_warmup_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Build job template, or an empty one when the file has none.
    pub fn template(&self) -> serde_yaml::Value {
        self.build_job_template
            .clone()
            .unwrap_or_else(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()))
    }

    pub fn stage_config(&self) -> StageConfig {
        let mut config = StageConfig::default();
        if let Some(image) = &self.stage_image {
            config.image = image.clone();
        }
        if let Some(ms) = self.timeouts.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.timeouts.stage_ready_secs {
            config.ready_timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(ms) = self.timeouts.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.timeouts.build_ready_secs {
            config.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeouts.build_completion_secs {
            config.completion_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeouts.log_warmup_secs {
            config.log_warmup = Duration::from_secs(secs);
        }
        config
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            namespace: self.namespace.clone(),
            stage: self.stage_config(),
            engine: self.engine_config(),
        }
    }
}
