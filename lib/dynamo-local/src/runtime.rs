//! Runtime lifecycle.
//!
//! A [`Runtime`] drives one DynamoDB Local instance through `load`, `init`, `start`, `stop` and `destroy`. The current
//! phase is tracked as an explicit [`RuntimeState`] and checked at the top of every operation, so out-of-order calls
//! fail deterministically with [`RuntimeError::OutOfOrder`].
//!
//! Callers serialize lifecycle calls for one instance, with one exception: `destroy` may run concurrently with an
//! in-flight `start`. Destroy wins. `start` re-checks for destruction once the container runtime returns, removes the
//! container it just launched, and fails with [`RuntimeError::DestroyedDuringStart`].

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catch::FaultBoundary,
    configuration::{
        Configuration, ConfigurationError, EmptyRegion, MissingNetworkMapping, RuntimeContext, AWS_REGION_KEY,
        DYNAMODB, REGION_KEY,
    },
    container::{ContainerHandle, ContainerRuntime, ContainerSpec},
    endpoint::{find_tcp_endpoint, Endpoint, EndpointNotFound},
    error::GenericError,
    identity::{Environment, ServiceIdentity, Settings},
    manifest::{ManifestError, ServiceManifest},
    network::{NetworkInstance, CONTAINER_HOST, LOCALHOST},
    service::{create_connection_configuration, ServiceBase},
};

const UNLOADED_SERVICE: &str = "<unloaded>";

/// Arguments passed to the DynamoDB Local jar. A shared database ignores the region and credentials of requests.
const DYNAMODB_LOCAL_ARGS: [&str; 4] = ["-jar", "DynamoDBLocal.jar", "-inMemory", "-sharedDb"];

/// Phase of the runtime lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeState {
    Unloaded,
    Loaded,
    Initialized,
    Running,
    Stopped,
    Destroyed,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Unloaded => "unloaded",
            RuntimeState::Loaded => "loaded",
            RuntimeState::Initialized => "initialized",
            RuntimeState::Running => "running",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RuntimeError {
    /// The operation was called in the wrong phase of the lifecycle.
    #[snafu(display(
        "cannot {} service {}: expected state {}, found {}",
        operation,
        service,
        expected,
        actual
    ))]
    OutOfOrder {
        service: String,
        operation: &'static str,
        expected: &'static str,
        actual: RuntimeState,
    },

    /// The instance was destroyed.
    #[snafu(display("cannot {} service {}: instance was destroyed", operation, service))]
    Destroyed { service: String, operation: &'static str },

    /// The service manifest could not be loaded.
    #[snafu(display("cannot load service {}: {}", service, source))]
    Load { service: String, source: ManifestError },

    /// The service declares no TCP endpoint.
    #[snafu(display("cannot load service {}: {}", service, source))]
    MissingEndpoint { service: String, source: EndpointNotFound },

    /// The proposed network mappings or the incoming configuration are unusable.
    #[snafu(display("cannot init service {}: {}", service, source))]
    Config {
        service: String,
        source: ConfigurationError,
    },

    /// A start is already in flight.
    #[snafu(display("cannot start service {}: already starting", service))]
    StartInProgress { service: String },

    /// The container could not be launched or resumed.
    #[snafu(display("cannot start service {}: {}", service, source))]
    Start { service: String, source: GenericError },

    /// The stop signal could not be delivered.
    #[snafu(display("cannot stop service {}: {}", service, source))]
    Stop { service: String, source: GenericError },

    /// The instance was destroyed while its container was starting. The container has been removed.
    #[snafu(display("service {} was destroyed while starting", service))]
    DestroyedDuringStart { service: String },

    /// An unexpected fault was caught while running the operation.
    #[snafu(display("internal fault during runtime {}: {}", operation, message))]
    Internal { operation: &'static str, message: String },
}

/// Runtime load request.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub identity: ServiceIdentity,
    pub environment: Environment,

    /// Let faults propagate instead of converting them into errors.
    pub disable_catch: bool,
}

impl LoadRequest {
    pub fn new(identity: ServiceIdentity, environment: Environment) -> Self {
        Self {
            identity,
            environment,
            disable_catch: false,
        }
    }
}

/// Runtime load response.
#[derive(Clone, Debug)]
pub struct LoadResponse {
    pub endpoints: Vec<Endpoint>,
}

/// Runtime init request.
#[derive(Clone, Debug, Default)]
pub struct InitRequest {
    /// Context the host reaches the instance from.
    pub runtime_context: RuntimeContext,

    /// Caller-supplied overrides. A `dynamodb` block may carry `region` (or `AWS_REGION`).
    pub configuration: Option<Configuration>,

    /// Proposed allocations, one per declared endpoint.
    pub proposed_network_mappings: Vec<NetworkInstance>,
}

/// Runtime init response.
#[derive(Clone, Debug)]
pub struct InitResponse {
    /// Connection configurations, the one for the requested runtime context first.
    pub runtime_configurations: Vec<Configuration>,

    /// Network mappings in use by the instance.
    pub network_mappings: Vec<NetworkInstance>,
}

struct Instance {
    state: RuntimeState,
    identity: Option<ServiceIdentity>,
    environment: Environment,
    settings: Settings,
    tcp_endpoint: Option<Endpoint>,
    region: Option<String>,
    network: Option<NetworkInstance>,
    container: Option<ContainerHandle>,
    starting: bool,
}

impl Instance {
    fn new() -> Self {
        Self {
            state: RuntimeState::Unloaded,
            identity: None,
            environment: Environment::local(),
            settings: Settings::default(),
            tcp_endpoint: None,
            region: None,
            network: None,
            container: None,
            starting: false,
        }
    }

    fn service(&self) -> String {
        self.identity
            .as_ref()
            .map(ServiceIdentity::unique)
            .unwrap_or_else(|| UNLOADED_SERVICE.to_string())
    }

    fn out_of_order(&self, operation: &'static str, expected: &'static str) -> RuntimeError {
        if self.state == RuntimeState::Destroyed {
            return Destroyed {
                service: self.service(),
                operation,
            }
            .build();
        }

        OutOfOrder {
            service: self.service(),
            operation,
            expected,
            actual: self.state,
        }
        .build()
    }
}

enum StartPlan {
    Launch {
        spec: ContainerSpec,
        network: NetworkInstance,
    },
    Resume(ContainerHandle),
}

/// Clears the in-flight start marker on drop, so a start that panics or is cancelled can be retried.
struct StartingGuard<'a> {
    instance: &'a Mutex<Instance>,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner).starting = false;
    }
}

/// Manages the live lifecycle of one DynamoDB Local instance.
pub struct Runtime {
    base: ServiceBase,
    containers: Arc<dyn ContainerRuntime>,
    faults: FaultBoundary,
    destroyed: CancellationToken,
    instance: Mutex<Instance>,
}

impl Runtime {
    /// Creates a new `Runtime` launching containers through `containers`.
    pub fn new(base: ServiceBase, containers: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            base,
            containers,
            faults: FaultBoundary::new(),
            destroyed: CancellationToken::new(),
            instance: Mutex::new(Instance::new()),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> RuntimeState {
        self.instance().state
    }

    /// Returns the network mapping in use, once initialized.
    pub fn network_instance(&self) -> Option<NetworkInstance> {
        self.instance().network.clone()
    }

    fn instance(&self) -> MutexGuard<'_, Instance> {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the service and resolves its declared endpoints.
    ///
    /// Loading again re-resolves the endpoints without affecting a running container.
    ///
    /// # Errors
    ///
    /// If the instance was destroyed, the manifest cannot be read, or it declares no TCP endpoint, an error is
    /// returned.
    pub async fn load(&self, request: LoadRequest) -> Result<LoadResponse, RuntimeError> {
        self.faults.set_disabled(request.disable_catch);

        self.faults
            .guard("load", self.load_inner(request), |message| {
                Internal {
                    operation: "load",
                    message,
                }
                .build()
            })
            .await
    }

    async fn load_inner(&self, request: LoadRequest) -> Result<LoadResponse, RuntimeError> {
        let LoadRequest {
            identity, environment, ..
        } = request;
        let service = identity.unique();

        let manifest = ServiceManifest::load_from_dir(&identity.service_dir())
            .await
            .context(Load {
                service: service.as_str(),
            })?;
        let tcp_endpoint = find_tcp_endpoint(&manifest.endpoints)
            .context(MissingEndpoint {
                service: service.as_str(),
            })?
            .clone();

        let mut instance = self.instance();
        if instance.state == RuntimeState::Destroyed {
            return Destroyed {
                service,
                operation: "load",
            }
            .fail();
        }
        if instance.state == RuntimeState::Unloaded {
            instance.state = RuntimeState::Loaded;
        }

        debug!(
            service = %identity,
            environment = %environment.name,
            endpoint = %tcp_endpoint,
            state = %instance.state,
            "Loaded runtime."
        );

        instance.identity = Some(identity);
        instance.environment = environment;
        instance.settings = manifest.spec;
        instance.tcp_endpoint = Some(tcp_endpoint);

        Ok(LoadResponse {
            endpoints: manifest.endpoints,
        })
    }

    /// Binds the instance to its network mapping and produces its connection configurations.
    ///
    /// The region is taken from the incoming configuration's `dynamodb` block when present, and from the service
    /// settings otherwise.
    ///
    /// # Errors
    ///
    /// If the runtime is not loaded, no proposed mapping realizes the TCP endpoint, or the region resolves to an empty
    /// value, an error is returned.
    pub async fn init(&self, request: InitRequest) -> Result<InitResponse, RuntimeError> {
        self.faults
            .guard("init", async { self.init_inner(request) }, |message| {
                Internal {
                    operation: "init",
                    message,
                }
                .build()
            })
            .await
    }

    fn init_inner(&self, request: InitRequest) -> Result<InitResponse, RuntimeError> {
        let mut instance = self.instance();
        if !matches!(instance.state, RuntimeState::Loaded | RuntimeState::Initialized) {
            return Err(instance.out_of_order("init", "loaded"));
        }

        let (Some(identity), Some(tcp_endpoint)) = (instance.identity.clone(), instance.tcp_endpoint.clone()) else {
            return Err(instance.out_of_order("init", "loaded"));
        };
        let service = identity.unique();

        let network = request
            .proposed_network_mappings
            .into_iter()
            .find(|mapping| mapping.endpoint.same_as(&tcp_endpoint))
            .context(MissingNetworkMapping {
                endpoint: tcp_endpoint.to_string(),
            })
            .context(Config {
                service: service.as_str(),
            })?;

        let region = resolve_region(request.configuration.as_ref(), &instance.settings);
        if region.is_empty() {
            return Err(EmptyRegion {
                origin: service.as_str(),
            }
            .build())
            .context(Config { service });
        }

        let contexts = match request.runtime_context {
            RuntimeContext::Container => [RuntimeContext::Container, RuntimeContext::Native],
            RuntimeContext::Native | RuntimeContext::Free => [RuntimeContext::Native, RuntimeContext::Container],
        };
        let runtime_configurations = contexts
            .into_iter()
            .map(|context| {
                let host = match context {
                    RuntimeContext::Container => CONTAINER_HOST,
                    RuntimeContext::Native | RuntimeContext::Free => LOCALHOST,
                };
                create_connection_configuration(&identity, &network.with_host(host), context, &region)
            })
            .collect();

        if let Some(previous) = instance.network.replace(network.clone()) {
            if previous.port != network.port {
                previous.release();
            }
        }

        debug!(
            service = %identity,
            port = network.port,
            region = %region,
            context = %request.runtime_context,
            "Initialized runtime."
        );

        instance.region = Some(region);
        instance.state = RuntimeState::Initialized;

        Ok(InitResponse {
            runtime_configurations,
            network_mappings: vec![network],
        })
    }

    /// Starts the instance: launches its container after init, or resumes it after a stop.
    ///
    /// Returns once the container runtime reports the container as started. Starting a running instance does nothing.
    ///
    /// The host port is released right before the launch. If the launch fails, the port is reserved again and the
    /// instance stays initialized, so `start` can be retried.
    ///
    /// # Errors
    ///
    /// If the runtime is not initialized, the container cannot be launched, or the instance is destroyed while the
    /// container starts, an error is returned.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.faults
            .guard("start", self.start_inner(), |message| {
                Internal {
                    operation: "start",
                    message,
                }
                .build()
            })
            .await
    }

    async fn start_inner(&self) -> Result<(), RuntimeError> {
        let (service, plan, starting) = {
            let mut instance = self.instance();
            let service = instance.service();

            let plan = match (instance.state, instance.container.clone()) {
                (RuntimeState::Running, _) => {
                    debug!(service = %service, "Runtime already running.");
                    return Ok(());
                }
                (RuntimeState::Stopped, Some(handle)) => StartPlan::Resume(handle),
                (RuntimeState::Initialized, None) => {
                    if instance.starting {
                        return StartInProgress { service }.fail();
                    }
                    let spec = self.container_spec(&instance);
                    match (spec, instance.network.clone()) {
                        (Some(spec), Some(network)) => StartPlan::Launch { spec, network },
                        _ => return Err(instance.out_of_order("start", "initialized")),
                    }
                }
                _ => return Err(instance.out_of_order("start", "initialized")),
            };

            instance.starting = true;
            let starting = StartingGuard {
                instance: &self.instance,
            };
            (service, plan, starting)
        };

        let (launched, released) = match plan {
            StartPlan::Launch { spec, network } => {
                network.release();
                info!(
                    service = %service,
                    container = %spec.name,
                    image = %spec.image,
                    port = network.port,
                    "Launching container."
                );
                (self.containers.launch(&spec).await, Some(network))
            }
            StartPlan::Resume(handle) => {
                info!(service = %service, container = %handle, "Resuming container.");
                (self.containers.resume(&handle).await.map(|()| handle), None)
            }
        };
        drop(starting);

        let handle = {
            let mut instance = self.instance();
            match launched {
                Ok(handle) if !self.destroyed.is_cancelled() => {
                    debug!(service = %service, container = %handle, "Runtime running.");
                    instance.container = Some(handle);
                    instance.state = RuntimeState::Running;
                    return Ok(());
                }
                Ok(handle) => handle,
                Err(e) if self.destroyed.is_cancelled() => {
                    debug!(service = %service, error = %e, "Container failed to start after destroy.");
                    return DestroyedDuringStart { service }.fail();
                }
                Err(e) => {
                    if let Some(network) = released {
                        if let Err(e) = network.reacquire() {
                            warn!(service = %service, port = network.port, error = %e, "Failed to reserve port again after launch failure.");
                        }
                    }
                    return Err(e).context(Start { service });
                }
            }
        };

        warn!(service = %service, container = %handle, "Runtime destroyed while starting. Removing container.");
        if let Err(e) = self.containers.remove(&handle).await {
            error!(service = %service, container = %handle, error = %e, "Failed to remove container launched during destroy.");
        }

        DestroyedDuringStart { service }.fail()
    }

    fn container_spec(&self, instance: &Instance) -> Option<ContainerSpec> {
        let identity = instance.identity.as_ref()?;
        let container_port = instance.tcp_endpoint.as_ref()?.tcp()?.port;
        let network = instance.network.as_ref()?;
        let region = instance.region.as_deref()?;

        let spec = ContainerSpec::new(container_name(identity), self.base.image())
            .with_command(DYNAMODB_LOCAL_ARGS)
            .with_env_var(AWS_REGION_KEY, region)
            .with_published_port(container_port, network.port)
            .with_label("service", identity.unique())
            .with_label("workspace", identity.workspace.as_str())
            .with_label("environment", instance.environment.name.as_str());
        Some(spec)
    }

    /// Stops the container gracefully, keeping the network mapping so that a later `start` resumes it.
    ///
    /// Stopping an instance with no running container does nothing.
    ///
    /// # Errors
    ///
    /// If the runtime was never initialized, or the stop signal cannot be delivered, an error is returned.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.faults
            .guard("stop", self.stop_inner(), |message| {
                Internal {
                    operation: "stop",
                    message,
                }
                .build()
            })
            .await
    }

    async fn stop_inner(&self) -> Result<(), RuntimeError> {
        let (service, handle) = {
            let instance = self.instance();
            match (instance.state, instance.container.clone()) {
                (RuntimeState::Running, Some(handle)) => (instance.service(), handle),
                (RuntimeState::Initialized | RuntimeState::Stopped, _) => {
                    debug!(service = %instance.service(), "No running container to stop.");
                    return Ok(());
                }
                _ => return Err(instance.out_of_order("stop", "running")),
            }
        };

        let outcome = self.containers.stop(&handle).await.context(Stop {
            service: service.as_str(),
        })?;

        let mut instance = self.instance();
        if instance.state == RuntimeState::Running {
            instance.state = RuntimeState::Stopped;
        }
        debug!(service = %service, container = %handle, ?outcome, "Runtime stopped.");

        Ok(())
    }

    /// Tears the instance down: stops and removes its container, releases its network mapping, and discards its
    /// state.
    ///
    /// Safe to call in any state, repeatedly, and concurrently with `start`. Teardown failures are logged, not
    /// returned.
    pub async fn destroy(&self) -> Result<(), RuntimeError> {
        self.faults
            .guard("destroy", self.destroy_inner(), |message| {
                Internal {
                    operation: "destroy",
                    message,
                }
                .build()
            })
            .await
    }

    async fn destroy_inner(&self) -> Result<(), RuntimeError> {
        self.destroyed.cancel();

        let (service, previous, container, network) = {
            let mut instance = self.instance();
            let previous = instance.state;
            instance.state = RuntimeState::Destroyed;
            instance.tcp_endpoint = None;
            instance.region = None;
            (instance.service(), previous, instance.container.take(), instance.network.take())
        };

        if previous == RuntimeState::Destroyed {
            debug!(service = %service, "Runtime already destroyed.");
            return Ok(());
        }

        if let Some(network) = network {
            network.release();
        }

        if let Some(handle) = container {
            match self.containers.stop(&handle).await {
                Ok(outcome) => debug!(service = %service, container = %handle, ?outcome, "Stopped container."),
                Err(e) => warn!(service = %service, container = %handle, error = %e, "Failed to stop container during destroy."),
            }

            match self.containers.remove(&handle).await {
                Ok(()) => info!(service = %service, container = %handle, "Removed container."),
                Err(e) => warn!(service = %service, container = %handle, error = %e, "Failed to remove container during destroy."),
            }
        }

        debug!(service = %service, previous = %previous, "Runtime destroyed.");
        Ok(())
    }
}

fn resolve_region(configuration: Option<&Configuration>, settings: &Settings) -> String {
    configuration
        .and_then(|configuration| configuration.info(DYNAMODB))
        .and_then(|info| info.get(REGION_KEY).or_else(|| info.get_ignore_case(AWS_REGION_KEY)))
        .unwrap_or(settings.region.as_str())
        .trim()
        .to_string()
}

/// Derives a container name from the identity, restricted to the characters Docker accepts.
fn container_name(identity: &ServiceIdentity) -> String {
    let raw = format!(
        "dynamodb-{}-{}-{}",
        identity.workspace, identity.module, identity.name
    );
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
