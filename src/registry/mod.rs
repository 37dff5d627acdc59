//! Remote registry interaction.
//!
//! The in-cluster engine pushes finished images; this module only resolves
//! what it pushed and points the final tag at it. Tagging moves the
//! manifest alone, the layers are already in the repository.

use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};
use serde::Deserialize;

use crate::digest::Digest;
use crate::error::ResolveError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RegistryConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Registries reached over plain HTTP, usually in-cluster ones.
    pub insecure_registries: Vec<String>,
}

/// Operations the build flow needs from a registry.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Digest of the manifest `image` currently points at.
    async fn remote_digest(&self, image: &str) -> Result<Digest, ResolveError>;

    /// Point `target` at the same manifest as `image`. Both references must
    /// name the same repository.
    async fn tag(&self, image: &str, target: &str) -> Result<(), ResolveError>;
}

pub struct OciRegistry {
    config: RegistryConfig,
}

impl OciRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    fn client(&self) -> Client {
        let protocol = if self.config.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.config.insecure_registries.clone())
        };
        Client::new(ClientConfig {
            protocol,
            ..Default::default()
        })
    }

    fn auth(&self) -> RegistryAuth {
        match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            _ => RegistryAuth::Anonymous,
        }
    }

    fn reference(image: &str) -> Result<Reference, ResolveError> {
        Reference::try_from(image).map_err(|e| ResolveError::Reference {
            reference: image.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ImageRegistry for OciRegistry {
    async fn remote_digest(&self, image: &str) -> Result<Digest, ResolveError> {
        let reference = Self::reference(image)?;
        let auth = self.auth();
        let client = self.client();

        let digest = client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .map_err(|e| ResolveError::Digest {
                reference: image.to_string(),
                reason: e.to_string(),
            })?;
        Digest::parse(&digest)
    }

    async fn tag(&self, image: &str, target: &str) -> Result<(), ResolveError> {
        let source = Self::reference(image)?;
        let destination = Self::reference(target)?;
        let auth = self.auth();
        let client = self.client();

        let tag_error = |e: oci_distribution::errors::OciDistributionError| ResolveError::Tag {
            reference: image.to_string(),
            target: target.to_string(),
            reason: e.to_string(),
        };

        let (manifest, _) = client
            .pull_manifest(&source, &auth)
            .await
            .map_err(tag_error)?;
        client
            .auth(&destination, &auth, RegistryOperation::Push)
            .await
            .map_err(tag_error)?;
        client
            .push_manifest(&destination, &manifest)
            .await
            .map_err(tag_error)?;

        tracing::debug!(%image, %target, "tagged image");
        Ok(())
    }
}
