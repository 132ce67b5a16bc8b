//! Configuration exchange.
//!
//! A [`Configuration`] is a namespaced key/value bundle describing how to connect to a running service. The runtime
//! produces one per [`RuntimeContext`] the service can be reached from, and downstream services pick the one matching
//! their own context.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, Snafu};

/// Name of the configuration block carrying DynamoDB connection parameters.
pub const DYNAMODB: &str = "dynamodb";

/// Key holding the endpoint URL.
pub const ENDPOINT_KEY: &str = "endpoint";

/// Key holding the AWS region.
pub const REGION_KEY: &str = "region";

/// Key holding the AWS profile.
pub const AWS_PROFILE_KEY: &str = "aws-profile";

/// Environment-style alias accepted for [`REGION_KEY`] in incoming configurations.
pub const AWS_REGION_KEY: &str = "AWS_REGION";

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ConfigurationError {
    /// No configuration matches the requested runtime context.
    #[snafu(display("no configuration for runtime context '{}'", context))]
    MissingContext {
        /// Requested runtime context.
        context: RuntimeContext,
    },

    /// The requested block does not exist.
    #[snafu(display("configuration from '{}' has no '{}' block", origin, name))]
    MissingBlock {
        /// Configuration origin.
        origin: String,

        /// Block name.
        name: String,
    },

    /// The requested key does not exist in the block.
    #[snafu(display("configuration block '{}' from '{}' has no key '{}'", name, origin, key))]
    MissingKey {
        /// Configuration origin.
        origin: String,

        /// Block name.
        name: String,

        /// Key name.
        key: String,
    },

    /// No proposed network mapping realizes a declared endpoint.
    #[snafu(display("no network mapping proposed for endpoint {}", endpoint))]
    MissingNetworkMapping {
        /// Endpoint lacking a mapping.
        endpoint: String,
    },

    /// Region resolution produced an empty value.
    #[snafu(display("region for '{}' resolved to an empty value", origin))]
    EmptyRegion {
        /// Service whose region is being resolved.
        origin: String,
    },
}

/// Selects how the values of a configuration should be interpreted.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum RuntimeContext {
    /// Values are reachable from processes running natively on the host.
    #[serde(rename = "native")]
    Native,

    /// Values are reachable from inside another container.
    #[serde(rename = "container-internal")]
    Container,

    /// No preference; the service picks the context it runs in.
    #[default]
    #[serde(rename = "free")]
    Free,
}

impl RuntimeContext {
    /// Returns the name of the context, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeContext::Native => "native",
            RuntimeContext::Container => "container-internal",
            RuntimeContext::Free => "free",
        }
    }
}

impl fmt::Display for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single key/value pair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigurationValue {
    /// Key.
    pub key: String,

    /// Value.
    pub value: String,
}

/// A named block of ordered key/value pairs.
///
/// Keys are unique within a block.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigurationInformation {
    /// Block name.
    pub name: String,

    /// Ordered values.
    #[serde(default)]
    pub values: Vec<ConfigurationValue>,
}

impl ConfigurationInformation {
    /// Creates an empty block.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    /// Sets `key` to `value`, replacing any existing value for the same key in place.
    pub fn with_value<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        let key = key.into();
        let value = value.into();
        match self.values.iter_mut().find(|existing| existing.key == key) {
            Some(existing) => existing.value = value,
            None => self.values.push(ConfigurationValue { key, value }),
        }
        self
    }

    /// Gets the value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|value| value.key == key)
            .map(|value| value.value.as_str())
    }

    /// Gets the value of `key`, comparing keys case-insensitively.
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|value| value.key.eq_ignore_ascii_case(key))
            .map(|value| value.value.as_str())
    }
}

/// Namespaced connection parameters for one runtime context.
///
/// Block names are unique within a configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Identity of the owning service.
    pub origin: String,

    /// Context the values apply to.
    pub runtime_context: RuntimeContext,

    /// Named blocks.
    #[serde(default)]
    pub infos: Vec<ConfigurationInformation>,
}

impl Configuration {
    /// Creates an empty configuration.
    pub fn new<S: Into<String>>(origin: S, runtime_context: RuntimeContext) -> Self {
        Self {
            origin: origin.into(),
            runtime_context,
            infos: Vec::new(),
        }
    }

    /// Adds a block, replacing any existing block with the same name.
    pub fn with_info(mut self, info: ConfigurationInformation) -> Self {
        match self.infos.iter_mut().find(|existing| existing.name == info.name) {
            Some(existing) => *existing = info,
            None => self.infos.push(info),
        }
        self
    }

    /// Gets the block named `name`.
    pub fn info(&self, name: &str) -> Option<&ConfigurationInformation> {
        self.infos.iter().find(|info| info.name == name)
    }

    /// Gets the value of `key` in block `name`.
    ///
    /// # Errors
    ///
    /// If either the block or the key does not exist, an error is returned.
    pub fn get_value(&self, name: &str, key: &str) -> Result<&str, ConfigurationError> {
        let info = self.info(name).context(MissingBlock {
            origin: self.origin.as_str(),
            name,
        })?;

        info.get(key).context(MissingKey {
            origin: self.origin.as_str(),
            name,
            key,
        })
    }
}

/// Picks the configuration matching `context`.
///
/// # Errors
///
/// If no configuration matches, an error is returned.
pub fn extract_configuration(
    configurations: &[Configuration], context: RuntimeContext,
) -> Result<&Configuration, ConfigurationError> {
    configurations
        .iter()
        .find(|configuration| configuration.runtime_context == context)
        .context(MissingContext { context })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamodb_config() -> Configuration {
        Configuration::new("mod/store", RuntimeContext::Native).with_info(
            ConfigurationInformation::new(DYNAMODB)
                .with_value(ENDPOINT_KEY, "http://localhost:8000")
                .with_value(REGION_KEY, "us-east-1"),
        )
    }

    #[test]
    fn with_value_keeps_keys_unique() {
        let info = ConfigurationInformation::new(DYNAMODB)
            .with_value(REGION_KEY, "us-east-1")
            .with_value(ENDPOINT_KEY, "http://localhost:1")
            .with_value(REGION_KEY, "eu-west-3");

        assert_eq!(info.values.len(), 2);
        assert_eq!(info.values[0].key, REGION_KEY);
        assert_eq!(info.get(REGION_KEY), Some("eu-west-3"));
    }

    #[test]
    fn with_info_keeps_names_unique() {
        let config = dynamodb_config().with_info(ConfigurationInformation::new(DYNAMODB).with_value(REGION_KEY, "x"));

        assert_eq!(config.infos.len(), 1);
        assert!(config.get_value(DYNAMODB, ENDPOINT_KEY).is_err());
        assert_eq!(config.get_value(DYNAMODB, REGION_KEY).unwrap(), "x");
    }

    #[test]
    fn get_value_names_missing_parts() {
        let config = dynamodb_config();

        let err = config.get_value("postgres", "url").unwrap_err();
        assert_eq!(err.to_string(), "configuration from 'mod/store' has no 'postgres' block");

        let err = config.get_value(DYNAMODB, "table").unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration block 'dynamodb' from 'mod/store' has no key 'table'"
        );
    }

    #[test]
    fn region_alias_lookup_ignores_case() {
        let info = ConfigurationInformation::new(DYNAMODB).with_value("aws_region", "us-east-2");
        assert_eq!(info.get_ignore_case(AWS_REGION_KEY), Some("us-east-2"));
        assert_eq!(info.get(AWS_REGION_KEY), None);
    }

    #[test]
    fn extract_by_context() {
        let configs = vec![
            dynamodb_config(),
            Configuration::new("mod/store", RuntimeContext::Container),
        ];

        let native = extract_configuration(&configs, RuntimeContext::Native).unwrap();
        assert_eq!(native.infos.len(), 1);

        let err = extract_configuration(&configs, RuntimeContext::Free).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingContext { .. }));
    }

    #[test]
    fn wire_shape() {
        let json = serde_json::to_value(dynamodb_config()).unwrap();

        assert_eq!(json["origin"], "mod/store");
        assert_eq!(json["runtimeContext"], "native");
        assert_eq!(json["infos"][0]["name"], "dynamodb");
        assert_eq!(json["infos"][0]["values"][1]["key"], "region");
    }
}
