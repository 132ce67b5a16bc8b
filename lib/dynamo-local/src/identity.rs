//! Service identity, environments and user-tunable settings.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Default AWS region used when neither the manifest nor the caller supplies one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Addressable handle for one logical service instance.
///
/// Created by the host at load time and never mutated afterwards.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    /// Service name, unique within its module and workspace.
    pub name: String,

    /// Module the service belongs to.
    pub module: String,

    /// Workspace the module belongs to.
    pub workspace: String,

    /// Absolute path to the workspace root.
    pub workspace_path: PathBuf,

    /// Path of the service directory, relative to the workspace root.
    pub relative_to_workspace: String,
}

impl ServiceIdentity {
    /// Returns the identifier of this service, unique within its workspace.
    pub fn unique(&self) -> String {
        format!("{}/{}", self.module, self.name)
    }

    /// Returns the directory holding the service's files.
    pub fn service_dir(&self) -> PathBuf {
        self.workspace_path.join(&self.relative_to_workspace)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.name)
    }
}

/// A workspace, grouping modules and their services.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Workspace {
    /// Workspace name.
    pub name: String,
}

impl Workspace {
    /// Creates a new `Workspace` with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

/// The environment a service is run in.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Environment {
    /// Environment name.
    pub name: String,

    /// Whether the environment runs on the local machine.
    pub local: bool,
}

impl Environment {
    /// Returns the local development environment.
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            local: true,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::local()
    }
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

/// User-tunable behavior of the service.
///
/// Persisted in the `spec` section of the service manifest.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Settings {
    /// AWS region reported to clients.
    #[serde(default = "default_region")]
    pub region: String,

    /// Whether the service should be restarted on source changes.
    #[serde(rename = "hot-reload", default)]
    pub hot_reload: bool,

    /// Logical database name.
    #[serde(rename = "database-name", default)]
    pub database_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: default_region(),
            hot_reload: false,
            database_name: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_is_module_and_name() {
        let identity = ServiceIdentity {
            name: "store".to_string(),
            module: "backend".to_string(),
            workspace: "demo".to_string(),
            workspace_path: PathBuf::from("/tmp/demo"),
            relative_to_workspace: "backend/store".to_string(),
        };

        assert_eq!(identity.unique(), "backend/store");
        assert_eq!(identity.to_string(), "backend/store");
        assert_eq!(identity.service_dir(), PathBuf::from("/tmp/demo/backend/store"));
    }

    #[test]
    fn settings_defaults_fill_missing_fields() {
        let settings: Settings = serde_yaml::from_str("hot-reload: true").unwrap();
        assert_eq!(settings.region, DEFAULT_REGION);
        assert!(settings.hot_reload);
        assert!(settings.database_name.is_empty());
    }
}
