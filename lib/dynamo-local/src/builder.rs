//! Build plane.
//!
//! The backing service is a stock public image, so building and deploying have nothing to do. The builder's real work
//! is scaffolding new services and declaring their endpoints.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    catch::FaultBoundary,
    endpoint::{find_tcp_endpoint, Api, Endpoint, EndpointNotFound, TcpApi, Visibility, TCP},
    identity::{ServiceIdentity, Settings},
    manifest::{ManifestError, ServiceManifest},
    service::ServiceBase,
    templates::TemplateError,
};

const FACTORY_PREFIX: &str = "factory/";
const GETTING_STARTED_TEMPLATE: &str = "factory/GETTING_STARTED.md";
const TCP_API_TEMPLATE: &str = "api/tcp.yaml";

/// Version written into the manifest of newly created services.
pub const INITIAL_SERVICE_VERSION: &str = "0.0.0";

/// Failure to declare the endpoints of a service.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EndpointDeclarationError {
    #[snafu(display("cannot load tcp api: {}", source))]
    LoadApi { source: TemplateError },

    #[snafu(display("cannot parse tcp api: {}", source))]
    ParseApi { source: serde_yaml::Error },
}

/// A builder error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum BuilderError {
    /// The service manifest could not be loaded.
    #[snafu(display("cannot load service {}: {}", service, source))]
    Load { service: String, source: ManifestError },

    /// The service declares no TCP endpoint.
    #[snafu(display("cannot load service {}: {}", service, source))]
    MissingEndpoint { service: String, source: EndpointNotFound },

    /// The getting started document could not be rendered.
    #[snafu(display("cannot prepare creation of service {}: {}", service, source))]
    GettingStarted { service: String, source: TemplateError },

    /// A scaffold template could not be rendered.
    #[snafu(display("cannot create service {}: cannot render scaffold: {}", service, source))]
    RenderScaffold { service: String, source: TemplateError },

    /// A scaffold file could not be written.
    #[snafu(display("cannot create service {}: cannot write {}: {}", service, path.display(), source))]
    WriteScaffold {
        service: String,
        path: PathBuf,
        source: io::Error,
    },

    /// Endpoint declaration failed.
    #[snafu(display("cannot create service {}: cannot create endpoints: {}", service, source))]
    CreateEndpoints {
        service: String,
        source: EndpointDeclarationError,
    },

    /// The updated manifest could not be saved.
    #[snafu(display("cannot create service {}: {}", service, source))]
    SaveManifest { service: String, source: ManifestError },

    /// An operation needing a loaded service was called before `load`.
    #[snafu(display("cannot {} before the builder is loaded", operation))]
    NotLoaded { operation: &'static str },

    /// An unexpected fault was caught while running the operation.
    #[snafu(display("internal fault during builder {}: {}", operation, message))]
    Internal { operation: &'static str, message: String },
}

/// Requests a creation flow instead of loading an existing service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CreationMode {
    /// Whether the host wants to ask the user questions before creating the service.
    pub communicate: bool,
}

/// A question asked to the user during creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub name: String,
    pub message: String,
}

/// Ordered questions asked during creation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QuestionSequence {
    questions: Vec<Question>,
}

impl QuestionSequence {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// Builder load request.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub identity: ServiceIdentity,

    /// Let faults propagate instead of converting them into errors.
    pub disable_catch: bool,

    pub creation_mode: Option<CreationMode>,

    /// Treat a missing manifest as a service with no prior state.
    pub allow_missing_manifest: bool,
}

impl LoadRequest {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            disable_catch: false,
            creation_mode: None,
            allow_missing_manifest: false,
        }
    }

    pub fn with_creation_mode(mut self, creation_mode: CreationMode) -> Self {
        self.creation_mode = Some(creation_mode);
        self
    }
}

/// Builder load response.
#[derive(Clone, Debug, Default)]
pub struct LoadResponse {
    pub endpoints: Vec<Endpoint>,
    pub getting_started: Option<String>,
}

/// Builder create response.
#[derive(Clone, Debug)]
pub struct CreateResponse {
    pub endpoints: Vec<Endpoint>,
    pub settings: Settings,
}

/// Acknowledgement of an operation with no output.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Ack;

/// Scaffolds services and declares their endpoints.
pub struct Builder {
    base: ServiceBase,
    faults: Arc<FaultBoundary>,
    identity: Option<ServiceIdentity>,
    settings: Settings,
    endpoints: Vec<Endpoint>,
    questions: Option<QuestionSequence>,
}

impl Builder {
    /// Creates a new `Builder`.
    pub fn new(base: ServiceBase) -> Self {
        Self {
            base,
            faults: Arc::new(FaultBoundary::new()),
            identity: None,
            settings: Settings::default(),
            endpoints: Vec::new(),
            questions: None,
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the questions registered for creation, if the host asked to communicate.
    pub fn questions(&self) -> Option<&QuestionSequence> {
        self.questions.as_ref()
    }

    /// Loads the build state of a service, or prepares its creation.
    ///
    /// # Errors
    ///
    /// If the manifest cannot be read (unless missing manifests are allowed), or it declares no TCP endpoint, an error
    /// is returned.
    pub async fn load(&mut self, request: LoadRequest) -> Result<LoadResponse, BuilderError> {
        self.faults.set_disabled(request.disable_catch);

        let faults = Arc::clone(&self.faults);
        faults
            .guard("load", self.load_inner(request), |message| {
                Internal {
                    operation: "load",
                    message,
                }
                .build()
            })
            .await
    }

    async fn load_inner(&mut self, request: LoadRequest) -> Result<LoadResponse, BuilderError> {
        let identity = request.identity;
        let service = identity.unique();
        debug!(service = %identity, "Loading builder.");

        if let Some(creation_mode) = request.creation_mode {
            let getting_started = self
                .base
                .render(GETTING_STARTED_TEMPLATE, Some(&identity))
                .context(GettingStarted { service })?;

            if creation_mode.communicate {
                self.questions = Some(QuestionSequence::new(Self::options()));
            }

            self.identity = Some(identity);
            return Ok(LoadResponse {
                endpoints: Vec::new(),
                getting_started: Some(getting_started),
            });
        }

        let manifest = match ServiceManifest::load_from_dir(&identity.service_dir()).await {
            Ok(manifest) => Some(manifest),
            Err(e) if e.is_missing() && request.allow_missing_manifest => {
                debug!(service = %identity, "No manifest found, continuing without prior state.");
                None
            }
            Err(e) => return Err(e).context(Load { service }),
        };

        if let Some(manifest) = manifest {
            let tcp = find_tcp_endpoint(&manifest.endpoints).context(MissingEndpoint {
                service: service.as_str(),
            })?;
            debug!(service = %identity, endpoint = %tcp, "Resolved TCP endpoint.");

            self.settings = manifest.spec;
            self.endpoints = manifest.endpoints;
        }

        self.identity = Some(identity);
        Ok(LoadResponse {
            endpoints: self.endpoints.clone(),
            getting_started: None,
        })
    }

    /// Acknowledges initialization.
    pub async fn init(&self) -> Result<Ack, BuilderError> {
        Ok(Ack)
    }

    /// Scaffolds a new service into its directory and declares its endpoints.
    ///
    /// # Errors
    ///
    /// If the builder is not loaded, or any stage of the creation fails, an error naming the stage is returned.
    pub async fn create(&mut self) -> Result<CreateResponse, BuilderError> {
        let faults = Arc::clone(&self.faults);
        faults
            .guard("create", self.create_inner(), |message| {
                Internal {
                    operation: "create",
                    message,
                }
                .build()
            })
            .await
    }

    async fn create_inner(&mut self) -> Result<CreateResponse, BuilderError> {
        let identity = self.identity.clone().context(NotLoaded { operation: "create" })?;
        let service = identity.unique();
        let service_dir = identity.service_dir();

        self.write_scaffold(&identity, &service_dir).await?;

        self.create_endpoints().context(CreateEndpoints {
            service: service.as_str(),
        })?;
        debug!(service = %identity, endpoints = self.endpoints.len(), "Created endpoints.");

        let mut manifest = ServiceManifest::new(identity.name.as_str(), INITIAL_SERVICE_VERSION);
        manifest.spec = self.settings.clone();
        manifest.endpoints = self.endpoints.clone();
        manifest
            .save_to_dir(&service_dir)
            .await
            .context(SaveManifest { service })?;

        Ok(CreateResponse {
            endpoints: self.endpoints.clone(),
            settings: self.settings.clone(),
        })
    }

    async fn write_scaffold(&self, identity: &ServiceIdentity, service_dir: &Path) -> Result<(), BuilderError> {
        let service = identity.unique();

        for path in self.base.templates().list(FACTORY_PREFIX) {
            let contents = self.base.render(path, Some(identity)).context(RenderScaffold {
                service: service.as_str(),
            })?;

            let target = service_dir.join(&path[FACTORY_PREFIX.len()..]);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.context(WriteScaffold {
                    service: service.as_str(),
                    path: parent.to_path_buf(),
                })?;
            }
            tokio::fs::write(&target, contents).await.context(WriteScaffold {
                service: service.as_str(),
                path: target.clone(),
            })?;

            debug!(service = %identity, path = %target.display(), "Wrote scaffold file.");
        }

        Ok(())
    }

    /// Declares the endpoints of the service: a single, external TCP endpoint.
    ///
    /// Replaces any previously declared endpoints.
    ///
    /// # Errors
    ///
    /// If the canonical TCP API shape cannot be loaded, an error is returned.
    pub fn create_endpoints(&mut self) -> Result<(), EndpointDeclarationError> {
        let raw = self
            .base
            .render(TCP_API_TEMPLATE, self.identity.as_ref())
            .context(LoadApi)?;
        let api: TcpApi = serde_yaml::from_str(&raw).context(ParseApi)?;

        let identity = self.identity.clone().unwrap_or_default();
        let endpoint = Endpoint::new(&identity, TCP, Api::Tcp(api)).with_visibility(Visibility::External);

        self.endpoints = vec![endpoint];
        Ok(())
    }

    /// Acknowledges a build. The image is pulled as-is, so there is nothing to build.
    pub async fn build(&self) -> Result<Ack, BuilderError> {
        Ok(Ack)
    }

    /// Acknowledges a deployment. The stock image is deployed unchanged.
    pub async fn deploy(&self) -> Result<Ack, BuilderError> {
        Ok(Ack)
    }

    pub async fn update(&self) -> Result<Ack, BuilderError> {
        Ok(Ack)
    }

    pub async fn sync(&self) -> Result<Ack, BuilderError> {
        Ok(Ack)
    }

    fn options() -> Vec<Question> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{manifest::MANIFEST_FILE, templates::EmbeddedTemplates};

    fn base() -> ServiceBase {
        ServiceBase::new(Arc::new(EmbeddedTemplates::bundled()))
    }

    fn identity_in(workspace: &Path) -> ServiceIdentity {
        ServiceIdentity {
            name: "store".to_string(),
            module: "backend".to_string(),
            workspace: "demo".to_string(),
            workspace_path: workspace.to_path_buf(),
            relative_to_workspace: "backend/services/store".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let identity = identity_in(dir.path());

        let mut builder = Builder::new(base());
        let response = builder
            .load(LoadRequest::new(identity.clone()).with_creation_mode(CreationMode { communicate: true }))
            .await
            .unwrap();
        assert!(response.getting_started.unwrap().contains("backend/store"));
        assert!(builder.questions().unwrap().is_empty());

        let created = builder.create().await.unwrap();
        assert_eq!(created.endpoints.len(), 1);

        let service_dir = identity.service_dir();
        assert!(service_dir.join(MANIFEST_FILE).exists());
        assert!(service_dir.join("README.md").exists());
        assert!(service_dir.join("tables/README.md").exists());

        let mut reloaded = Builder::new(base());
        let response = reloaded.load(LoadRequest::new(identity)).await.unwrap();
        assert_eq!(response.endpoints, created.endpoints);
        assert!(response.getting_started.is_none());
    }

    #[tokio::test]
    async fn load_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let identity = identity_in(dir.path());

        let mut builder = Builder::new(base());
        let err = builder.load(LoadRequest::new(identity.clone())).await.unwrap_err();
        assert!(matches!(err, BuilderError::Load { .. }));
        assert!(err.to_string().starts_with("cannot load service backend/store"));

        let mut request = LoadRequest::new(identity);
        request.allow_missing_manifest = true;
        let response = builder.load(request).await.unwrap();
        assert!(response.endpoints.is_empty());
    }

    #[tokio::test]
    async fn load_without_tcp_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let identity = identity_in(dir.path());
        ServiceManifest::new("store", "0.0.1")
            .save_to_dir(&identity.service_dir())
            .await
            .unwrap();

        let mut builder = Builder::new(base());
        let err = builder.load(LoadRequest::new(identity)).await.unwrap_err();
        assert!(matches!(err, BuilderError::MissingEndpoint { .. }));
    }

    #[tokio::test]
    async fn create_before_load() {
        let mut builder = Builder::new(base());
        let err = builder.create().await.unwrap_err();
        assert!(matches!(err, BuilderError::NotLoaded { operation: "create" }));
    }

    #[tokio::test]
    async fn create_names_endpoint_stage() {
        static ENTRIES: &[(&str, &str)] = &[
            ("factory/GETTING_STARTED.md", "hi"),
            ("api/tcp.yaml", "port: not-a-port"),
        ];

        let dir = tempfile::tempdir().unwrap();
        let mut builder = Builder::new(ServiceBase::new(Arc::new(EmbeddedTemplates::from_entries(ENTRIES))));
        builder
            .load(LoadRequest::new(identity_in(dir.path())).with_creation_mode(CreationMode::default()))
            .await
            .unwrap();
        assert!(builder.questions().is_none());

        let err = builder.create().await.unwrap_err();
        assert!(matches!(err, BuilderError::CreateEndpoints { .. }));
        assert!(err.to_string().contains("cannot create endpoints"));
    }

    #[tokio::test]
    async fn no_op_operations_acknowledge() {
        let builder = Builder::new(base());
        assert_eq!(builder.init().await.unwrap(), Ack);
        assert_eq!(builder.build().await.unwrap(), Ack);
        assert_eq!(builder.deploy().await.unwrap(), Ack);
        assert_eq!(builder.update().await.unwrap(), Ack);
        assert_eq!(builder.sync().await.unwrap(), Ack);
    }

    fn arb_prior_endpoint() -> impl Strategy<Value = Endpoint> {
        ("[a-z]{1,8}", any::<u16>(), any::<bool>()).prop_map(|(name, port, external)| {
            let visibility = if external {
                Visibility::External
            } else {
                Visibility::Internal
            };
            Endpoint::new(&ServiceIdentity::default(), name, Api::Tcp(TcpApi { port })).with_visibility(visibility)
        })
    }

    proptest! {
        #[test]
        fn create_endpoints_yields_one_external_tcp_endpoint(
            prior in proptest::collection::vec(arb_prior_endpoint(), 0..5),
            loaded in any::<bool>(),
        ) {
            let mut builder = Builder::new(base());
            builder.endpoints = prior;
            if loaded {
                builder.identity = Some(identity_in(Path::new("/tmp/demo")));
            }

            builder.create_endpoints().unwrap();

            prop_assert_eq!(builder.endpoints.len(), 1);
            let endpoint = &builder.endpoints[0];
            prop_assert_eq!(endpoint.visibility, Visibility::External);
            prop_assert_eq!(endpoint.name.as_str(), TCP);
            prop_assert_eq!(endpoint.tcp(), Some(&TcpApi { port: 8000 }));
        }
    }
}
