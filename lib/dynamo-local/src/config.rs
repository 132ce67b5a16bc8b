//! Agent configuration.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Deserialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    docker::DockerContainerRuntime,
    error::GenericError,
    network::NetworkManager,
    service::{ServiceBase, DEFAULT_IMAGE},
    templates::TemplateStore,
};

/// Prefix of environment variables overriding the agent configuration.
pub const ENV_PREFIX: &str = "DYNAMO_LOCAL";

const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// A configuration loading error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LoaderError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be read.
    #[snafu(display("Failed to read configuration file {}: {}", path.display(), source))]
    ReadFile { path: PathBuf, source: io::Error },

    /// A field has the wrong data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        field: String,
        expected_ty: String,
        actual_ty: String,
    },

    /// Any other extraction failure.
    #[snafu(display("Failed to extract configuration: {}", source))]
    Extract { source: figment::Error },
}

impl From<figment::Error> for LoaderError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Extract { source: e },
        }
    }
}

/// Layers configuration sources, later sources taking precedence over earlier ones.
pub struct ConfigurationLoader {
    figment: Figment,
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self { figment: Figment::new() }
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, an error is returned. Invalid YAML surfaces when extracting.
    pub fn from_yaml<P: AsRef<Path>>(mut self, path: P) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ReadFile { path })?;
        self.figment = self.figment.admerge(Yaml::string(&raw));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring a file that cannot be read.
    pub fn try_from_yaml<P: AsRef<Path>>(self, path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self {
                figment: self.figment.admerge(Yaml::string(&raw)),
            },
            Err(e) => {
                debug!(error = %e, file_path = %path.display(), "Unable to read YAML configuration file. Ignoring.");
                self
            }
        }
    }

    /// Loads configuration from environment variables starting with `prefix`.
    ///
    /// An underscore is appended to the prefix if it does not already end with one.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, LoaderError> {
        if prefix.is_empty() {
            return EmptyPrefix.fail();
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        self.figment = self.figment.admerge(Env::prefixed(&prefix));
        Ok(self)
    }

    /// Consumes the loader and deserializes the layered configuration into `T`.
    ///
    /// # Errors
    ///
    /// If the configuration does not match the shape of `T`, an error is returned.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, LoaderError> {
        self.figment.extract().map_err(Into::into)
    }
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_stop_timeout_secs() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

/// Agent configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AgentConfiguration {
    /// DynamoDB Local image to run.
    #[serde(default = "default_image")]
    pub image: String,

    /// Allocate OS-assigned ports instead of deterministic ones.
    #[serde(default)]
    pub temporary_ports: bool,

    /// Directory receiving container logs, if capturing them.
    #[serde(default)]
    pub container_log_dir: Option<PathBuf>,

    /// Grace period given to the container when stopping it.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            image: default_image(),
            temporary_ports: false,
            container_log_dir: None,
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl AgentConfiguration {
    /// Loads the configuration from an optional YAML file, then `DYNAMO_LOCAL_*` environment variables.
    ///
    /// # Errors
    ///
    /// If the file is given but unreadable, or the configuration is invalid, an error is returned.
    pub fn load(path: Option<&Path>) -> Result<Self, LoaderError> {
        let mut loader = ConfigurationLoader::new();
        if let Some(path) = path {
            loader = loader.from_yaml(path)?;
        }
        loader.from_environment(ENV_PREFIX)?.into_typed()
    }

    pub fn service_base(&self, templates: Arc<dyn TemplateStore>) -> ServiceBase {
        ServiceBase::new(templates).with_image(self.image.as_str())
    }

    pub fn network_manager(&self) -> NetworkManager {
        if self.temporary_ports {
            NetworkManager::new().with_temporary_ports()
        } else {
            NetworkManager::new()
        }
    }

    /// Connects to the local Docker daemon with this configuration.
    ///
    /// # Errors
    ///
    /// If the Docker client cannot be created, an error is returned.
    pub fn container_runtime(&self) -> Result<DockerContainerRuntime, GenericError> {
        let mut runtime = DockerContainerRuntime::connect()?.with_stop_timeout_secs(self.stop_timeout_secs);
        if let Some(log_dir) = &self.container_log_dir {
            runtime = runtime.with_logging(log_dir.clone());
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_sources() {
        let config: AgentConfiguration = ConfigurationLoader::new().into_typed().unwrap();
        assert_eq!(config, AgentConfiguration::default());
        assert_eq!(config.image, "amazon/dynamodb-local:latest");
        assert_eq!(config.stop_timeout_secs, 10);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "image: dynamodb-local:2.5\ntemporary_ports: true\n").unwrap();

        let config: AgentConfiguration = ConfigurationLoader::new().from_yaml(&path).unwrap().into_typed().unwrap();
        assert_eq!(config.image, "dynamodb-local:2.5");
        assert!(config.temporary_ports);
        assert_eq!(config.container_log_dir, None);
    }

    #[test]
    fn missing_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        assert!(matches!(
            ConfigurationLoader::new().from_yaml(&path),
            Err(LoaderError::ReadFile { .. })
        ));

        let config: AgentConfiguration = ConfigurationLoader::new().try_from_yaml(&path).into_typed().unwrap();
        assert_eq!(config, AgentConfiguration::default());
    }

    #[test]
    fn environment_overrides_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "image: from-file\nstop_timeout_secs: 3\n").unwrap();

        std::env::set_var("DYNAMO_LOCAL_CONFIG_TEST_IMAGE", "from-env");
        let config: AgentConfiguration = ConfigurationLoader::new()
            .from_yaml(&path)
            .unwrap()
            .from_environment("DYNAMO_LOCAL_CONFIG_TEST")
            .unwrap()
            .into_typed()
            .unwrap();
        std::env::remove_var("DYNAMO_LOCAL_CONFIG_TEST_IMAGE");

        assert_eq!(config.image, "from-env");
        assert_eq!(config.stop_timeout_secs, 3);
    }

    #[test]
    fn invalid_field_type_names_the_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "stop_timeout_secs: soon\n").unwrap();

        let err = ConfigurationLoader::new()
            .from_yaml(&path)
            .unwrap()
            .into_typed::<AgentConfiguration>()
            .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidFieldType { ref field, .. } if field == "stop_timeout_secs"));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::new().from_environment(""),
            Err(LoaderError::EmptyPrefix)
        ));
    }
}
