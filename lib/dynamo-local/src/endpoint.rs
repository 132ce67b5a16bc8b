//! Declared endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, Snafu};

use crate::identity::ServiceIdentity;

/// Name of the TCP endpoint.
pub const TCP: &str = "tcp";

/// Who can reach an endpoint.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Reachable from outside the module.
    External,

    /// Reachable only from within the module.
    #[default]
    Internal,
}

/// Shape of a raw TCP API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TcpApi {
    /// Port the service listens on inside its container.
    pub port: u16,
}

/// The API an endpoint exposes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Api {
    /// Raw TCP.
    Tcp(TcpApi),
}

/// A declared, network-reachable interface of a service.
///
/// Endpoints describe the static shape of a service and exist independently of any running instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Endpoint {
    /// Logical endpoint name.
    pub name: String,

    /// Owning service name.
    pub service: String,

    /// Owning module name.
    pub module: String,

    /// Endpoint visibility.
    #[serde(default)]
    pub visibility: Visibility,

    /// Exposed API.
    pub api: Api,
}

impl Endpoint {
    /// Creates an endpoint for the given service and API, with internal visibility.
    pub fn new<S: Into<String>>(identity: &ServiceIdentity, name: S, api: Api) -> Self {
        Self {
            name: name.into(),
            service: identity.name.clone(),
            module: identity.module.clone(),
            visibility: Visibility::Internal,
            api,
        }
    }

    /// Sets the visibility of the endpoint.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Returns the TCP API of this endpoint, if it exposes one.
    pub fn tcp(&self) -> Option<&TcpApi> {
        match &self.api {
            Api::Tcp(api) => Some(api),
        }
    }

    /// Returns `true` if `other` refers to the same logical endpoint.
    pub fn same_as(&self, other: &Endpoint) -> bool {
        self.name == other.name && self.service == other.service && self.module == other.module
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visibility = match self.visibility {
            Visibility::External => "external",
            Visibility::Internal => "internal",
        };
        write!(f, "{}/{}/{} ({})", self.module, self.service, self.name, visibility)
    }
}

/// A required endpoint was not declared.
#[derive(Debug, Snafu)]
#[snafu(display("no {} endpoint declared", protocol))]
pub struct EndpointNotFound {
    protocol: &'static str,
}

/// Finds the sole TCP endpoint among `endpoints`.
///
/// # Errors
///
/// If no endpoint exposes a TCP API, an error is returned.
pub fn find_tcp_endpoint(endpoints: &[Endpoint]) -> Result<&Endpoint, EndpointNotFound> {
    endpoints
        .iter()
        .find(|endpoint| endpoint.tcp().is_some())
        .context(EndpointNotFoundSnafu { protocol: TCP })
}
