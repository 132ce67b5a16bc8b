//! Service manifest.
//!
//! Each service directory carries a `service.yaml` describing the service, its settings and its declared endpoints.
//! The builder writes it when scaffolding a service; both the builder and the runtime read it when loading.

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

use crate::{endpoint::Endpoint, identity::Settings};

/// File name of the service manifest.
pub const MANIFEST_FILE: &str = "service.yaml";

/// Name of the agent managing services of this kind.
pub const AGENT_NAME: &str = "dynamodb";

/// A manifest error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ManifestError {
    /// The manifest could not be read.
    #[snafu(display("failed to read service manifest {}: {}", path.display(), source))]
    Read {
        /// Manifest path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// The manifest is not valid YAML, or has the wrong shape.
    #[snafu(display("failed to parse service manifest {}: {}", path.display(), source))]
    Parse {
        /// Manifest path.
        path: PathBuf,

        /// Error source.
        source: serde_yaml::Error,
    },

    /// The manifest could not be serialized.
    #[snafu(display("failed to serialize service manifest: {}", source))]
    Encode {
        /// Error source.
        source: serde_yaml::Error,
    },

    /// The manifest could not be written.
    #[snafu(display("failed to write service manifest {}: {}", path.display(), source))]
    Write {
        /// Manifest path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },
}

impl ManifestError {
    /// Returns `true` if the manifest file does not exist.
    pub fn is_missing(&self) -> bool {
        matches!(self, ManifestError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

fn default_agent() -> String {
    AGENT_NAME.to_string()
}

/// Persisted description of a service.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ServiceManifest {
    /// Service name.
    pub name: String,

    /// Service version.
    #[serde(default)]
    pub version: String,

    /// Managing agent.
    #[serde(default = "default_agent")]
    pub agent: String,

    /// Service settings.
    #[serde(default)]
    pub spec: Settings,

    /// Declared endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

impl ServiceManifest {
    /// Creates a new manifest for a service with the given name and version.
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            agent: default_agent(),
            ..Default::default()
        }
    }

    /// Loads the manifest stored in `dir`.
    ///
    /// # Errors
    ///
    /// If the manifest cannot be read or parsed, an error is returned.
    pub async fn load_from_dir(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&path).await.context(Read { path: path.clone() })?;
        serde_yaml::from_str(&raw).context(Parse { path })
    }

    /// Saves the manifest into `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// If the manifest cannot be serialized or written, an error is returned.
    pub async fn save_to_dir(&self, dir: &Path) -> Result<(), ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = serde_yaml::to_string(self).context(Encode)?;

        tokio::fs::create_dir_all(dir).await.context(Write { path: path.clone() })?;
        tokio::fs::write(&path, raw).await.context(Write { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("mod").join("store");

        let mut manifest = ServiceManifest::new("store", "0.0.1");
        manifest.spec.region = "eu-west-1".to_string();
        manifest.save_to_dir(&service_dir).await.unwrap();

        let loaded = ServiceManifest::load_from_dir(&service_dir).await.unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.agent, AGENT_NAME);
    }

    #[tokio::test]
    async fn missing_manifest_is_reported_as_missing() {
        let dir = tempfile::tempdir().unwrap();

        let err = ServiceManifest::load_from_dir(dir.path()).await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn malformed_manifest_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(MANIFEST_FILE), "name: [unterminated")
            .await
            .unwrap();

        let err = ServiceManifest::load_from_dir(dir.path()).await.unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        assert!(!err.is_missing());
    }
}
