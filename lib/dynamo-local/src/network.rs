//! Network negotiation.
//!
//! The [`NetworkManager`] turns declared endpoints into concrete host-port allocations. Ports are allocated by binding a
//! listener on the host and holding it in a [`PortReservation`] until the owner releases it, right before the container
//! that will use the port is launched. Uniqueness is enforced by the operating system, so concurrent allocations never
//! collide, including with processes outside of this crate.

use std::{
    fmt,
    hash::Hasher as _,
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener},
    ops::Range,
    sync::{Arc, Mutex, PoisonError},
};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    endpoint::{Endpoint, TCP},
    identity::{Environment, ServiceIdentity, Workspace},
};

/// Host name used to reach allocated ports from the host itself.
pub const LOCALHOST: &str = "localhost";

/// Host name used to reach allocated ports from inside other containers.
pub const CONTAINER_HOST: &str = "host.docker.internal";

/// Range deterministic ports are drawn from.
const DETERMINISTIC_PORT_RANGE: Range<u16> = 11000..21000;

/// Number of ports probed after the preferred deterministic port before giving up.
const MAX_PROBES: u16 = 64;

/// A network negotiation error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum NetworkError {
    /// No port could be bound for an endpoint.
    #[snafu(display("failed to allocate a host port for endpoint {}: {}", endpoint, source))]
    Allocation {
        /// Endpoint being allocated.
        endpoint: String,

        /// Error source.
        source: io::Error,
    },

    /// A required endpoint was not declared.
    #[snafu(display("service {} declares no {} endpoint", service, protocol))]
    NotFound {
        /// Service identity.
        service: String,

        /// Missing protocol.
        protocol: &'static str,
    },
}

/// A host port held on behalf of a network instance.
///
/// The port stays bound until [`release`][PortReservation::release] is called or the reservation is dropped.
pub struct PortReservation {
    port: u16,
    listener: Mutex<Option<TcpListener>>,
}

impl PortReservation {
    fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Returns the reserved port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if the port is still bound by this reservation.
    pub fn is_held(&self) -> bool {
        self.listener.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Releases the port so that another process can bind it.
    ///
    /// Releasing is idempotent.
    pub fn release(&self) {
        let mut guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!(port = self.port, "Released port reservation.");
        }
    }

    /// Binds the port again after a release. Does nothing while the port is still held.
    ///
    /// # Errors
    ///
    /// If another process bound the port in the meantime, an error is returned.
    pub fn reacquire(&self) -> io::Result<()> {
        let mut guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)))?);
            debug!(port = self.port, "Reacquired port reservation.");
        }
        Ok(())
    }
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReservation")
            .field("port", &self.port)
            .field("held", &self.is_held())
            .finish()
    }
}

/// A concrete allocation of an [`Endpoint`] to a host port.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkInstance {
    /// Endpoint this instance realizes.
    pub endpoint: Endpoint,

    /// Host the port is reachable on.
    pub host: String,

    /// Allocated host port.
    pub port: u16,

    #[serde(skip)]
    reservation: Option<Arc<PortReservation>>,
}

impl NetworkInstance {
    /// Creates a network instance without a backing reservation.
    pub fn new<S: Into<String>>(endpoint: Endpoint, host: S, port: u16) -> Self {
        Self {
            endpoint,
            host: host.into(),
            port,
            reservation: None,
        }
    }

    /// Returns the `host:port` address of the instance.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the HTTP URL of the instance.
    pub fn url(&self) -> String {
        format!("http://{}", self.address())
    }

    /// Returns the same allocation, addressed through `host`.
    pub fn with_host<S: Into<String>>(&self, host: S) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }

    /// Returns `true` if the port is still reserved by the negotiator.
    pub fn is_reserved(&self) -> bool {
        self.reservation.as_ref().is_some_and(|reservation| reservation.is_held())
    }

    /// Releases the port reservation backing this instance, if any.
    ///
    /// Every clone of the instance shares the same reservation, so releasing through one releases it for all.
    pub fn release(&self) {
        if let Some(reservation) = &self.reservation {
            reservation.release();
        }
    }

    /// Reserves the port again after [`release`][NetworkInstance::release], if the instance is backed by a
    /// reservation.
    ///
    /// # Errors
    ///
    /// If the port was taken in the meantime, an error is returned.
    pub fn reacquire(&self) -> io::Result<()> {
        match &self.reservation {
            Some(reservation) => reservation.reacquire(),
            None => Ok(()),
        }
    }
}

impl PartialEq for NetworkInstance {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint && self.host == other.host && self.port == other.port
    }
}

/// How host ports are picked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PortStrategy {
    /// Stable ports derived from the endpoint's identity.
    Deterministic,

    /// Ports assigned by the operating system from its ephemeral range.
    Temporary,
}

/// Allocates host ports for declared endpoints.
pub struct NetworkManager {
    strategy: PortStrategy,
}

impl NetworkManager {
    /// Creates a new `NetworkManager` that allocates stable, deterministic ports.
    pub fn new() -> Self {
        Self {
            strategy: PortStrategy::Deterministic,
        }
    }

    /// Switches to ports assigned by the operating system from its ephemeral range.
    ///
    /// Useful for tests, where multiple runs may happen concurrently.
    pub fn with_temporary_ports(mut self) -> Self {
        self.strategy = PortStrategy::Temporary;
        self
    }

    /// Allocates one network instance per endpoint, preserving order.
    ///
    /// # Errors
    ///
    /// If `endpoints` holds no TCP endpoint, or if a port cannot be bound for any endpoint, an error is returned. On
    /// error, ports already reserved by this call are released.
    pub fn generate_network_mappings(
        &self, environment: &Environment, workspace: &Workspace, identity: &ServiceIdentity, endpoints: &[Endpoint],
    ) -> Result<Vec<NetworkInstance>, NetworkError> {
        if !endpoints.iter().any(|endpoint| endpoint.tcp().is_some()) {
            return NotFound {
                service: identity.unique(),
                protocol: TCP,
            }
            .fail();
        }

        let mut instances = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let reservation = match self.reserve(environment, workspace, endpoint) {
                Ok(reservation) => reservation,
                Err(e) => {
                    instances.iter().for_each(NetworkInstance::release);
                    return Err(e);
                }
            };

            debug!(
                service = %identity,
                environment = %environment.name,
                endpoint = %endpoint,
                port = reservation.port(),
                "Allocated host port."
            );

            instances.push(NetworkInstance {
                endpoint: endpoint.clone(),
                host: LOCALHOST.to_string(),
                port: reservation.port(),
                reservation: Some(Arc::new(reservation)),
            });
        }

        Ok(instances)
    }

    fn reserve(
        &self, environment: &Environment, workspace: &Workspace, endpoint: &Endpoint,
    ) -> Result<PortReservation, NetworkError> {
        match self.strategy {
            PortStrategy::Temporary => PortReservation::bind(0).context(Allocation {
                endpoint: endpoint.to_string(),
            }),
            PortStrategy::Deterministic => {
                let preferred = deterministic_port(environment, workspace, endpoint);
                let span = DETERMINISTIC_PORT_RANGE.end - DETERMINISTIC_PORT_RANGE.start;

                let mut last_error = None;
                for offset in 0..MAX_PROBES {
                    let candidate =
                        DETERMINISTIC_PORT_RANGE.start + (preferred - DETERMINISTIC_PORT_RANGE.start + offset) % span;
                    match PortReservation::bind(candidate) {
                        Ok(reservation) => return Ok(reservation),
                        Err(e) => last_error = Some(e),
                    }
                }

                let source = last_error
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port available in range"));
                Err(source).context(Allocation {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }
}

fn deterministic_port(environment: &Environment, workspace: &Workspace, endpoint: &Endpoint) -> u16 {
    let mut hasher = FnvHasher::default();
    for part in [
        environment.name.as_str(),
        workspace.name.as_str(),
        endpoint.module.as_str(),
        endpoint.service.as_str(),
        endpoint.name.as_str(),
    ] {
        hasher.write(part.as_bytes());
        hasher.write_u8(b'/');
    }

    let span = u64::from(DETERMINISTIC_PORT_RANGE.end - DETERMINISTIC_PORT_RANGE.start);
    DETERMINISTIC_PORT_RANGE.start + (hasher.finish() % span) as u16
}
