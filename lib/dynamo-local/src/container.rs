//! Container runtime capability.
//!
//! The runtime lifecycle launches and stops its backing container through [`ContainerRuntime`], which keeps the
//! lifecycle independent of the container engine. [`DockerContainerRuntime`][crate::docker::DockerContainerRuntime]
//! is the production implementation.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;

use crate::error::GenericError;

/// Everything needed to launch a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Command passed to the image entrypoint, if overriding the image default.
    pub command: Option<Vec<String>>,

    /// Environment variables, as `KEY=VALUE`.
    pub env: Vec<String>,

    /// Published ports.
    pub ports: Vec<PortBinding>,

    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Creates a new `ContainerSpec` for the given container name and image.
    pub fn new<N: Into<String>, I: Into<String>>(name: N, image: I) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: None,
            env: Vec::new(),
            ports: Vec::new(),
            labels: HashMap::new(),
        }
    }

    /// Overrides the command passed to the image entrypoint.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Adds an environment variable.
    pub fn with_env_var<K: AsRef<str>, V: AsRef<str>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    /// Publishes `container_port` on `host_port`.
    pub fn with_published_port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.push(PortBinding {
            protocol: "tcp",
            container_port,
            host_port,
        });
        self
    }

    /// Adds a label.
    pub fn with_label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A port published from a container onto the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortBinding {
    /// Protocol, `tcp` or `udp`.
    pub protocol: &'static str,

    /// Port inside the container.
    pub container_port: u16,

    /// Port on the host.
    pub host_port: u16,
}

impl PortBinding {
    /// Returns the port key in `<port>/<protocol>` form.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Handle to a launched container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerHandle {
    /// Container ID assigned by the engine.
    pub id: String,

    /// Container name.
    pub name: String,
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Outcome of a stop request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// The container was running and has been stopped.
    Stopped,

    /// The container was not running, or no longer exists.
    NotRunning,
}

/// A container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a container from `spec`.
    ///
    /// Returns once the engine reports the container as started.
    ///
    /// # Errors
    ///
    /// If the image cannot be pulled, or the container cannot be created or started, an error is returned.
    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, GenericError>;

    /// Starts a previously stopped container.
    ///
    /// # Errors
    ///
    /// If the container cannot be started, an error is returned.
    async fn resume(&self, handle: &ContainerHandle) -> Result<(), GenericError>;

    /// Stops a container gracefully.
    ///
    /// # Errors
    ///
    /// If the stop signal cannot be delivered, an error is returned. A container that is not running, or that no longer
    /// exists, is not an error.
    async fn stop(&self, handle: &ContainerHandle) -> Result<StopOutcome, GenericError>;

    /// Removes a container, killing it if necessary.
    ///
    /// # Errors
    ///
    /// If the container exists and cannot be removed, an error is returned.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), GenericError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use super::*;
    use crate::generic_error;

    /// Counters shared between a [`MockContainerRuntime`] and the test observing it.
    #[derive(Default)]
    pub struct MockCounters {
        pub launched: AtomicUsize,
        pub resumed: AtomicUsize,
        pub stopped: AtomicUsize,
        pub removed: AtomicUsize,
    }

    /// In-memory container runtime for lifecycle tests.
    #[derive(Clone, Default)]
    pub struct MockContainerRuntime {
        counters: Arc<MockCounters>,
        running: Arc<Mutex<HashMap<String, bool>>>,
        launched_specs: Arc<Mutex<Vec<ContainerSpec>>>,
        fail_launch: Arc<AtomicBool>,
        fail_stop: Arc<AtomicBool>,
        fail_remove: Arc<AtomicBool>,
        launch_delay: Option<Duration>,
        resume_delay: Option<Duration>,
    }

    impl MockContainerRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_launch_delay(mut self, delay: Duration) -> Self {
            self.launch_delay = Some(delay);
            self
        }

        pub fn with_resume_delay(mut self, delay: Duration) -> Self {
            self.resume_delay = Some(delay);
            self
        }

        pub fn counters(&self) -> Arc<MockCounters> {
            Arc::clone(&self.counters)
        }

        pub fn fail_launch(&self, fail: bool) {
            self.fail_launch.store(fail, Ordering::SeqCst);
        }

        pub fn fail_stop(&self, fail: bool) {
            self.fail_stop.store(fail, Ordering::SeqCst);
        }

        pub fn fail_remove(&self, fail: bool) {
            self.fail_remove.store(fail, Ordering::SeqCst);
        }

        pub fn running_containers(&self) -> usize {
            self.running.lock().unwrap().values().filter(|running| **running).count()
        }

        pub fn existing_containers(&self) -> usize {
            self.running.lock().unwrap().len()
        }

        pub fn launched_specs(&self) -> Vec<ContainerSpec> {
            self.launched_specs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockContainerRuntime {
        async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, GenericError> {
            if let Some(delay) = self.launch_delay {
                tokio::time::sleep(delay).await;
            }

            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(generic_error!("image '{}' unavailable", spec.image));
            }

            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            self.launched_specs.lock().unwrap().push(spec.clone());

            let id = format!("mock-{}", self.counters.launched.load(Ordering::SeqCst));
            self.running.lock().unwrap().insert(id.clone(), true);

            Ok(ContainerHandle {
                id,
                name: spec.name.clone(),
            })
        }

        async fn resume(&self, handle: &ContainerHandle) -> Result<(), GenericError> {
            if let Some(delay) = self.resume_delay {
                tokio::time::sleep(delay).await;
            }

            match self.running.lock().unwrap().get_mut(&handle.id) {
                Some(running) => {
                    *running = true;
                    self.counters.resumed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                None => Err(generic_error!("no such container: {}", handle.id)),
            }
        }

        async fn stop(&self, handle: &ContainerHandle) -> Result<StopOutcome, GenericError> {
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(generic_error!("engine unreachable"));
            }

            match self.running.lock().unwrap().get_mut(&handle.id) {
                Some(running) if *running => {
                    *running = false;
                    self.counters.stopped.fetch_add(1, Ordering::SeqCst);
                    Ok(StopOutcome::Stopped)
                }
                _ => Ok(StopOutcome::NotRunning),
            }
        }

        async fn remove(&self, handle: &ContainerHandle) -> Result<(), GenericError> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(generic_error!("engine unreachable"));
            }

            if self.running.lock().unwrap().remove(&handle.id).is_some() {
                self.counters.removed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder() {
        let spec = ContainerSpec::new("dynamodb-test", "amazon/dynamodb-local:latest")
            .with_command(["-jar", "DynamoDBLocal.jar"])
            .with_env_var("AWS_REGION", "us-east-2")
            .with_published_port(8000, 12345)
            .with_label("created_by", "dynamo-local");

        assert_eq!(spec.command.as_deref().map(<[String]>::len), Some(2));
        assert_eq!(spec.env, vec!["AWS_REGION=us-east-2".to_string()]);
        assert_eq!(spec.ports[0].container_key(), "8000/tcp");
        assert_eq!(spec.ports[0].host_port, 12345);
        assert_eq!(spec.labels.get("created_by").map(String::as_str), Some("dynamo-local"));
    }
}
