//! Docker-backed container runtime.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StopContainerOptions,
    },
    errors::Error,
    image::CreateImageOptions,
    models::{HostConfig, PortBinding as DockerPortBinding},
    Docker,
};
use chrono::Utc;
use futures::StreamExt as _;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt as _, BufWriter},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    container::{ContainerHandle, ContainerRuntime, ContainerSpec, StopOutcome},
    error::{ErrorContext as _, GenericError},
    generic_error,
};

/// Label identifying containers created by this crate.
pub const CREATED_BY_LABEL: &str = "created_by";

/// Value of [`CREATED_BY_LABEL`].
pub const CREATED_BY: &str = "dynamo-local";

/// Default grace period given to a container when stopping it, in seconds.
const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;

/// A [`ContainerRuntime`] talking to the local Docker daemon.
pub struct DockerContainerRuntime {
    docker: Docker,
    logs: Option<LogCapture>,
    stop_timeout_secs: i64,
}

impl DockerContainerRuntime {
    /// Connects to the local Docker daemon with the default connection settings.
    ///
    /// # Errors
    ///
    /// If the Docker client cannot be created/configured, an error will be returned.
    pub fn connect() -> Result<Self, GenericError> {
        let docker = Docker::connect_with_defaults().error_context("Failed to connect to the Docker daemon.")?;

        Ok(Self {
            docker,
            logs: None,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        })
    }

    /// Captures container logs into the given directory.
    ///
    /// Each container gets a log for standard output and standard error, following the pattern of `<container
    /// name>.[stdout|stderr].log`. A launch starts the logs afresh, and a resume appends to them.
    pub fn with_logging(mut self, log_dir: PathBuf) -> Self {
        self.logs = Some(LogCapture::new(log_dir));
        self
    }

    /// Sets the grace period given to containers when stopping them.
    pub fn with_stop_timeout_secs(mut self, secs: u64) -> Self {
        self.stop_timeout_secs = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    async fn pull_image(&self, image: &str) -> Result<(), GenericError> {
        debug!(image, "Pulling image...");

        let image_options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut create_stream = self.docker.create_image(Some(image_options), None, None);
        while let Some(info) = create_stream.next().await {
            let info = info.with_error_context(|| format!("Failed to pull image '{}'.", image))?;
            trace!(image, "Received image pull update: {:?}", info);
        }

        debug!(image, "Pulled image.");

        Ok(())
    }

    async fn remove_stale_container(&self, name: &str) -> Result<(), GenericError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!(container = name, "Removed stale container.");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_error_context(|| format!("Failed to remove stale container '{}'.", name)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, GenericError> {
        self.pull_image(&spec.image).await?;
        self.remove_stale_container(&spec.name).await?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for binding in &spec.ports {
            exposed_ports.insert(binding.container_key(), HashMap::new());
            port_bindings.insert(
                binding.container_key(),
                Some(vec![DockerPortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let mut labels = spec.labels.clone();
        labels.insert(CREATED_BY_LABEL.to_string(), CREATED_BY.to_string());

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        debug!(container = %spec.name, "Creating container...");
        let response = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .with_error_context(|| format!("Failed to create container '{}'.", spec.name))?;

        let handle = ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
        };

        debug!(container = %handle, "Starting container...");
        if let Err(e) = self.docker.start_container::<String>(&handle.id, None).await {
            // Don't leave a created-but-dead container behind.
            let _ = self.remove(&handle).await;
            return Err(e).with_error_context(|| format!("Failed to start container '{}'.", handle.name));
        }

        if let Some(logs) = &self.logs {
            logs.follow(&self.docker, &handle, FollowFrom::Launch).await?;
        }

        debug!(container = %handle, "Started container.");

        Ok(handle)
    }

    async fn resume(&self, handle: &ContainerHandle) -> Result<(), GenericError> {
        let since = Utc::now().timestamp();
        self.docker
            .start_container::<String>(&handle.id, None)
            .await
            .with_error_context(|| format!("Failed to start container '{}'.", handle.name))?;

        if let Some(logs) = &self.logs {
            logs.follow(&self.docker, handle, FollowFrom::Resume { since }).await?;
        }

        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<StopOutcome, GenericError> {
        let start = Instant::now();
        let options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };

        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => {
                debug!(container = %handle, "Container stopped after {:?}.", start.elapsed());
                Ok(StopOutcome::Stopped)
            }
            Err(e) if is_not_modified(&e) || is_not_found(&e) => Ok(StopOutcome::NotRunning),
            Err(e) => Err(generic_error!("Failed to stop container '{}': {}", handle.name, e)),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), GenericError> {
        if let Some(logs) = &self.logs {
            logs.unfollow(handle);
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_error_context(|| format!("Failed to remove container '{}'.", handle.name)),
        }
    }
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::DockerResponseServerError { status_code: 404, .. })
}

fn is_not_modified(e: &Error) -> bool {
    matches!(e, Error::DockerResponseServerError { status_code: 304, .. })
}

/// Where a log follower starts reading.
#[derive(Clone, Copy, Debug)]
enum FollowFrom {
    /// From the beginning of a freshly launched container. Existing log files are truncated.
    Launch,

    /// From `since` (Unix seconds) on a resumed container. Output is appended to the existing log files.
    Resume { since: i64 },
}

/// Follows container output into per-container log files.
///
/// One follower runs per container. It is cancelled when the container is removed, or replaced when the container is
/// resumed.
struct LogCapture {
    log_dir: PathBuf,
    followers: Mutex<HashMap<String, CancellationToken>>,
}

impl LogCapture {
    fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            followers: Mutex::new(HashMap::new()),
        }
    }

    async fn follow(&self, docker: &Docker, handle: &ContainerHandle, from: FollowFrom) -> Result<(), GenericError> {
        // Surface permission issues here rather than in the background task.
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .error_context("Failed to create logs directory. Possible permissions issue.")?;
        let append = matches!(from, FollowFrom::Resume { .. });
        let mut files = LogFiles::open(&self.log_dir, &handle.name, append).await?;

        let since = match from {
            FollowFrom::Launch => 0,
            FollowFrom::Resume { since } => since,
        };
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since,
            ..Default::default()
        };
        let mut log_stream = docker.logs(&handle.id, Some(options));

        let token = CancellationToken::new();
        if let Some(previous) = self.followers().insert(handle.id.clone(), token.clone()) {
            previous.cancel();
        }

        debug!(container = %handle, ?from, "Capturing logs to {}...", self.log_dir.display());
        let container = handle.to_string();
        tokio::spawn(async move {
            loop {
                let output = tokio::select! {
                    _ = token.cancelled() => break,
                    next = log_stream.next() => match next {
                        Some(Ok(output)) => output,
                        Some(Err(e)) => {
                            error!(container = %container, error = %e, "Failed to read log line from container.");
                            break;
                        }
                        None => break,
                    },
                };

                if let Err(e) = files.write(output).await {
                    error!(container = %container, error = %e, "Failed to write container log line.");
                    break;
                }
            }

            files.sync(&container).await;
        });

        Ok(())
    }

    fn unfollow(&self, handle: &ContainerHandle) {
        if let Some(token) = self.followers().remove(&handle.id) {
            debug!(container = %handle, "Stopped capturing logs.");
            token.cancel();
        }
    }

    fn followers(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.followers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Standard output and standard error log files of one container.
struct LogFiles {
    stdout: BufWriter<File>,
    stderr: BufWriter<File>,
}

impl LogFiles {
    async fn open(log_dir: &Path, container_name: &str, append: bool) -> Result<Self, GenericError> {
        let (stdout_path, stderr_path) = log_paths(log_dir, container_name);

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }

        let stdout = options
            .open(&stdout_path)
            .await
            .map(BufWriter::new)
            .error_context("Failed to open standard output log file. Possible permissions issue.")?;
        let stderr = options
            .open(&stderr_path)
            .await
            .map(BufWriter::new)
            .error_context("Failed to open standard error log file. Possible permissions issue.")?;

        Ok(Self { stdout, stderr })
    }

    /// Writes one chunk of container output to the matching file. Input and console output are dropped.
    async fn write(&mut self, output: LogOutput) -> io::Result<()> {
        let (file, message) = match output {
            LogOutput::StdOut { message } => (&mut self.stdout, message),
            LogOutput::StdErr { message } => (&mut self.stderr, message),
            LogOutput::StdIn { .. } | LogOutput::Console { .. } => return Ok(()),
        };

        file.write_all(&message[..]).await?;
        file.flush().await
    }

    async fn sync(&mut self, container: &str) {
        if let Err(e) = self.stdout.get_mut().sync_all().await {
            error!(container = %container, error = %e, "Failed to fsync standard output log file.");
        }
        if let Err(e) = self.stderr.get_mut().sync_all().await {
            error!(container = %container, error = %e, "Failed to fsync standard error log file.");
        }
    }
}

fn log_paths(log_dir: &Path, container_name: &str) -> (PathBuf, PathBuf) {
    (
        log_dir.join(format!("{}.stdout.log", container_name)),
        log_dir.join(format!("{}.stderr.log", container_name)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(line: &str) -> LogOutput {
        LogOutput::StdOut {
            message: line.as_bytes().to_vec().into(),
        }
    }

    fn stderr(line: &str) -> LogOutput {
        LogOutput::StdErr {
            message: line.as_bytes().to_vec().into(),
        }
    }

    #[test]
    fn log_paths_follow_container_name() {
        let (stdout_path, stderr_path) = log_paths(Path::new("/tmp/logs"), "dynamodb-test-mod-svc");
        assert_eq!(stdout_path, Path::new("/tmp/logs/dynamodb-test-mod-svc.stdout.log"));
        assert_eq!(stderr_path, Path::new("/tmp/logs/dynamodb-test-mod-svc.stderr.log"));
    }

    #[tokio::test]
    async fn output_is_routed_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = LogFiles::open(dir.path(), "store", false).await.unwrap();

        files.write(stdout("Initializing DynamoDB Local\n")).await.unwrap();
        files.write(stderr("WARN: in-memory only\n")).await.unwrap();
        files
            .write(LogOutput::StdIn {
                message: b"ignored".to_vec().into(),
            })
            .await
            .unwrap();
        files.sync("store").await;

        let (stdout_path, stderr_path) = log_paths(dir.path(), "store");
        assert_eq!(
            tokio::fs::read_to_string(&stdout_path).await.unwrap(),
            "Initializing DynamoDB Local\n"
        );
        assert_eq!(
            tokio::fs::read_to_string(&stderr_path).await.unwrap(),
            "WARN: in-memory only\n"
        );
    }

    #[tokio::test]
    async fn resume_appends_and_launch_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let (stdout_path, _) = log_paths(dir.path(), "store");

        let mut files = LogFiles::open(dir.path(), "store", false).await.unwrap();
        files.write(stdout("first run\n")).await.unwrap();
        drop(files);

        let mut files = LogFiles::open(dir.path(), "store", true).await.unwrap();
        files.write(stdout("resumed\n")).await.unwrap();
        drop(files);
        assert_eq!(
            tokio::fs::read_to_string(&stdout_path).await.unwrap(),
            "first run\nresumed\n"
        );

        let mut files = LogFiles::open(dir.path(), "store", false).await.unwrap();
        files.write(stdout("relaunched\n")).await.unwrap();
        drop(files);
        assert_eq!(tokio::fs::read_to_string(&stdout_path).await.unwrap(), "relaunched\n");
    }
}
