//! Build job resource schema.
//!
//! A `BuildJob` is the custom resource the in-cluster engine acts on. Users
//! may supply a partial one as a template; [`BuildJobTemplate::fulfill`]
//! fills the fields the orchestrator owns before submission. Template
//! parsing is strict: unknown fields in the job or its spec are rejected so
//! typos fail loudly instead of silently building the wrong thing.

use serde::{Deserialize, Serialize};

use crate::cluster::ObjectMeta;
use crate::error::ConfigError;
use crate::util::{random_hex, unix_nanos};

/// API group and version this client can fulfill and submit.
pub const API_VERSION_V1ALPHA1: &str = "build.kiln.dev/v1alpha1";
pub const KIND_BUILD_JOB: &str = "BuildJob";
pub const LANGUAGE_DOCKERFILE: &str = "Dockerfile";
pub const CONTEXT_HTTP: &str = "HTTP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BuildJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: BuildJobSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BuildJobStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BuildJobSpec {
    pub registry: RegistrySpec,
    pub language: LanguageSpec,
    pub context: ContextSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RegistrySpec {
    /// Fully qualified reference the engine pushes to.
    pub target: String,
    pub push: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct LanguageSpec {
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ContextSpec {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct HttpContext {
    pub url: String,
}

/// Status written by the engine's controller. Lenient on purpose: the
/// controller is free to add fields we do not read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildJobStatus {
    /// Name of the batch job executing the build.
    pub job: String,
}

impl BuildJob {
    /// Fill the fields the orchestrator owns. Defaults apply only where the
    /// template left a field empty; the registry target, push flag, and
    /// context are always overwritten since they describe this build, not
    /// the template.
    pub fn fulfill(mut self, target: &str, context_url: &str) -> Self {
        if self.api_version.is_empty() {
            self.api_version = API_VERSION_V1ALPHA1.to_string();
        }
        if self.kind.is_empty() {
            self.kind = KIND_BUILD_JOB.to_string();
        }
        if self.metadata.name.is_empty() {
            self.metadata.name = format!("kiln-{}-{}", unix_nanos(), random_hex(1));
        }
        if self.spec.language.kind.is_empty() {
            self.spec.language.kind = LANGUAGE_DOCKERFILE.to_string();
        }

        self.spec.registry.target = target.to_string();
        self.spec.registry.push = true;
        self.spec.context = ContextSpec {
            kind: CONTEXT_HTTP.to_string(),
            http: Some(HttpContext {
                url: context_url.to_string(),
            }),
        };
        self
    }
}

/// A user-supplied build job template, tagged by the API version it parsed
/// under. Versions gate strict parsing: a template for a version this
/// client does not understand is refused up front.
#[derive(Debug, Clone)]
pub enum BuildJobTemplate {
    V1Alpha1(BuildJob),
}

impl BuildJobTemplate {
    /// Parse a template from configuration. A missing `apiVersion` selects
    /// the newest supported version.
    pub fn from_value(value: &serde_yaml::Value) -> Result<Self, ConfigError> {
        let api_version = value
            .get("apiVersion")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or(API_VERSION_V1ALPHA1);

        match api_version {
            API_VERSION_V1ALPHA1 => serde_yaml::from_value(value.clone())
                .map(Self::V1Alpha1)
                .map_err(|e| ConfigError::MalformedTemplate {
                    reason: e.to_string(),
                }),
            other => Err(ConfigError::UnsupportedApiVersion {
                found: other.to_string(),
            }),
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::V1Alpha1(_) => API_VERSION_V1ALPHA1,
        }
    }

    pub fn fulfill(self, target: &str, context_url: &str) -> Self {
        match self {
            Self::V1Alpha1(job) => Self::V1Alpha1(job.fulfill(target, context_url)),
        }
    }

    pub fn into_build_job(self) -> BuildJob {
        match self {
            Self::V1Alpha1(job) => job,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_template(yaml: &str) -> Result<BuildJobTemplate, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        BuildJobTemplate::from_value(&value)
    }

    #[test]
    fn test_empty_template_selects_newest_version() {
        let template = parse_template("{}").unwrap();
        assert_eq!(template.api_version(), API_VERSION_V1ALPHA1);
    }

    #[test]
    fn test_unsupported_version_is_refused() {
        let err = parse_template("apiVersion: build.kiln.dev/v9\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnsupportedApiVersion { found } if found == "build.kiln.dev/v9"
        ));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = parse_template("buidjob: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedTemplate { .. }));

        let err = parse_template("spec:\n  langauge:\n    kind: Dockerfile\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedTemplate { .. }));
    }

    #[test]
    fn test_metadata_extras_are_tolerated() {
        let template = parse_template(concat!(
            "metadata:\n",
            "  name: custom\n",
            "  annotations:\n",
            "    team: platform\n",
        ))
        .unwrap();
        assert_eq!(template.into_build_job().metadata.name, "custom");
    }

    #[test]
    fn test_fulfill_defaults_only_empty_fields() {
        let template = parse_template(concat!(
            "metadata:\n",
            "  name: custom\n",
            "spec:\n",
            "  language:\n",
            "    kind: Buildpack\n",
        ))
        .unwrap();

        let job = template
            .fulfill("registry.local/app:abc", "http://stage/ctx.tar.gz")
            .into_build_job();

        assert_eq!(job.api_version, API_VERSION_V1ALPHA1);
        assert_eq!(job.kind, KIND_BUILD_JOB);
        assert_eq!(job.metadata.name, "custom");
        assert_eq!(job.spec.language.kind, "Buildpack");
        assert_eq!(job.spec.registry.target, "registry.local/app:abc");
        assert!(job.spec.registry.push);
    }

    #[test]
    fn test_fulfill_generates_unique_names() {
        let job = BuildJob::default().fulfill("app:abc", "http://stage/ctx.tar.gz");
        let name = job.metadata.name;

        let rest = name.strip_prefix("kiln-").expect("generated name prefix");
        let (nanos, suffix) = rest.rsplit_once('-').expect("generated name suffix");
        assert!(!nanos.is_empty() && nanos.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(suffix.len(), 1);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fulfill_overrides_preset_registry_target() {
        let template = parse_template(concat!(
            "spec:\n",
            "  registry:\n",
            "    target: someone-elses/image:old\n",
            "    push: false\n",
        ))
        .unwrap();

        let job = template
            .fulfill("registry.local/app:abc", "http://stage/ctx.tar.gz")
            .into_build_job();

        assert_eq!(job.spec.registry.target, "registry.local/app:abc");
        assert!(job.spec.registry.push);
    }

    #[test]
    fn test_fulfill_replaces_any_existing_context() {
        let template = parse_template(concat!(
            "spec:\n",
            "  context:\n",
            "    kind: GCS\n",
        ))
        .unwrap();

        let job = template
            .fulfill("app:abc", "http://stage/ctx.tar.gz")
            .into_build_job();

        assert_eq!(job.spec.context.kind, CONTEXT_HTTP);
        assert_eq!(
            job.spec.context.http.expect("http context").url,
            "http://stage/ctx.tar.gz"
        );
    }

    #[test]
    fn test_submission_payload_is_camel_case() {
        let job = BuildJob::default().fulfill("app:abc", "http://stage/ctx.tar.gz");
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["apiVersion"], API_VERSION_V1ALPHA1);
        assert_eq!(value["spec"]["registry"]["target"], "app:abc");
        assert_eq!(value["spec"]["context"]["http"]["url"], "http://stage/ctx.tar.gz");
        assert!(value["spec"]["registry"].get("secretRef").is_none());
        assert!(value.get("status").is_none());
    }
}
