//! Pieces shared by the builder and the runtime.

use std::sync::Arc;

use serde::Serialize;

use crate::{
    configuration::{
        Configuration, ConfigurationInformation, RuntimeContext, AWS_PROFILE_KEY, DYNAMODB, ENDPOINT_KEY, REGION_KEY,
    },
    identity::ServiceIdentity,
    manifest::AGENT_NAME,
    network::NetworkInstance,
    templates::{render, TemplateError, TemplateStore},
};

/// Version of this agent.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default DynamoDB Local image.
pub const DEFAULT_IMAGE: &str = "amazon/dynamodb-local:latest";

const AGENT_README_TEMPLATE: &str = "agent/README.md";

/// A capability offered by this agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Scaffolds and declares services.
    Builder,

    /// Runs service instances.
    Runtime,
}

/// Describes one field of a configuration block.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConfigurationFieldDetail {
    pub name: &'static str,
    pub description: &'static str,
}

/// Describes a configuration block the agent understands.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConfigurationDetail {
    pub name: &'static str,
    pub description: &'static str,
    pub fields: Vec<ConfigurationFieldDetail>,
}

/// Self-description of the agent, as reported to hosts.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInformation {
    pub capabilities: Vec<Capability>,
    pub configuration_details: Vec<ConfigurationDetail>,
    pub readme: String,
}

#[derive(Serialize)]
struct AgentData {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServiceData<'a> {
    name: &'a str,
    module: &'a str,
    workspace: &'a str,
}

/// Values available to templates.
#[derive(Serialize)]
pub struct TemplateData<'a> {
    image: &'a str,
    agent: AgentData,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<ServiceData<'a>>,
}

/// Template store and image shared by the builder and the runtime of one service.
#[derive(Clone)]
pub struct ServiceBase {
    templates: Arc<dyn TemplateStore>,
    image: String,
}

impl ServiceBase {
    /// Creates a new `ServiceBase` over the given template store, using the default image.
    pub fn new(templates: Arc<dyn TemplateStore>) -> Self {
        Self {
            templates,
            image: DEFAULT_IMAGE.to_string(),
        }
    }

    /// Overrides the container image.
    pub fn with_image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = image.into();
        self
    }

    pub fn templates(&self) -> &dyn TemplateStore {
        self.templates.as_ref()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Builds the template data for `identity`, or for the agent alone.
    pub fn template_data<'a>(&'a self, identity: Option<&'a ServiceIdentity>) -> TemplateData<'a> {
        TemplateData {
            image: &self.image,
            agent: AgentData {
                name: AGENT_NAME,
                version: AGENT_VERSION,
            },
            service: identity.map(|identity| ServiceData {
                name: &identity.name,
                module: &identity.module,
                workspace: &identity.workspace,
            }),
        }
    }

    /// Renders the template at `path` for `identity`.
    ///
    /// # Errors
    ///
    /// If the template cannot be rendered, an error is returned.
    pub fn render(&self, path: &str, identity: Option<&ServiceIdentity>) -> Result<String, TemplateError> {
        render(self.templates(), path, &self.template_data(identity))
    }

    /// Describes this agent.
    ///
    /// # Errors
    ///
    /// If the README template cannot be rendered, an error is returned.
    pub fn agent_information(&self) -> Result<AgentInformation, TemplateError> {
        Ok(AgentInformation {
            capabilities: vec![Capability::Builder, Capability::Runtime],
            configuration_details: vec![ConfigurationDetail {
                name: DYNAMODB,
                description: "dynamodb credentials",
                fields: vec![
                    ConfigurationFieldDetail {
                        name: REGION_KEY,
                        description: "AWS region",
                    },
                    ConfigurationFieldDetail {
                        name: AWS_PROFILE_KEY,
                        description: "AWS profile",
                    },
                ],
            }],
            readme: self.render(AGENT_README_TEMPLATE, None)?,
        })
    }
}

/// Builds the connection configuration of `identity` as reachable through `instance` from `context`.
pub fn create_connection_configuration(
    identity: &ServiceIdentity, instance: &NetworkInstance, context: RuntimeContext, region: &str,
) -> Configuration {
    Configuration::new(identity.unique(), context).with_info(
        ConfigurationInformation::new(DYNAMODB)
            .with_value(ENDPOINT_KEY, instance.url())
            .with_value(REGION_KEY, region),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::{Api, Endpoint, TcpApi, TCP},
        templates::EmbeddedTemplates,
    };

    fn base() -> ServiceBase {
        ServiceBase::new(Arc::new(EmbeddedTemplates::bundled()))
    }

    fn identity() -> ServiceIdentity {
        ServiceIdentity {
            name: "store".to_string(),
            module: "backend".to_string(),
            workspace: "demo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn agent_information_describes_dynamodb_block() {
        let info = base().with_image("dynamodb-local:test").agent_information().unwrap();

        assert_eq!(info.capabilities, vec![Capability::Builder, Capability::Runtime]);
        assert_eq!(info.configuration_details.len(), 1);

        let detail = &info.configuration_details[0];
        assert_eq!(detail.name, "dynamodb");
        let fields = detail.fields.iter().map(|field| field.name).collect::<Vec<_>>();
        assert_eq!(fields, vec!["region", "aws-profile"]);

        assert!(info.readme.contains("dynamodb-local:test"));
        assert!(info.readme.contains(AGENT_VERSION));
    }

    #[test]
    fn service_templates_need_an_identity() {
        let base = base();

        let rendered = base.render("factory/README.md", Some(&identity())).unwrap();
        assert!(rendered.starts_with("# store"));

        let err = base.render("factory/README.md", None).unwrap_err();
        assert!(matches!(err, TemplateError::MissingValue { .. }));
    }

    #[test]
    fn connection_configuration_shape() {
        let identity = identity();
        let endpoint = Endpoint::new(&identity, TCP, Api::Tcp(TcpApi { port: 8000 }));
        let instance = NetworkInstance::new(endpoint, "localhost", 12345);

        let config = create_connection_configuration(&identity, &instance, RuntimeContext::Native, "us-east-2");

        assert_eq!(config.origin, "backend/store");
        assert_eq!(config.runtime_context, RuntimeContext::Native);
        assert_eq!(config.infos.len(), 1);
        assert_eq!(config.get_value(DYNAMODB, ENDPOINT_KEY).unwrap(), "http://localhost:12345");
        assert_eq!(config.get_value(DYNAMODB, REGION_KEY).unwrap(), "us-east-2");
    }
}
