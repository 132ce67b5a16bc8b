use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use dynamo_local::identity::ServiceIdentity;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to the agent configuration file.
    ///
    /// Settings from the file are overridden by `DYNAMO_LOCAL_*` environment variables.
    #[arg(global = true, short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Scaffold a new DynamoDB service in a workspace.
    #[command(name = "create")]
    Create(ServiceArgs),

    /// Run a DynamoDB Local instance for an existing service until interrupted.
    #[command(name = "run")]
    Run(RunConfig),

    /// Print information about this agent.
    #[command(name = "info")]
    Info,
}

/// Identifies a service within a workspace.
#[derive(Args, Clone)]
pub struct ServiceArgs {
    /// Service name.
    #[arg(short = 'n', long)]
    pub name: String,

    /// Module the service belongs to.
    #[arg(short = 'm', long)]
    pub module: String,

    /// Workspace name.
    #[arg(short = 'w', long, default_value = "local")]
    pub workspace: String,

    /// Path to the workspace root.
    #[arg(long, default_value = ".")]
    pub workspace_path: PathBuf,

    /// Path of the service directory, relative to the workspace root.
    ///
    /// Defaults to `<module>/<name>`.
    #[arg(long)]
    pub path: Option<String>,
}

impl ServiceArgs {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            name: self.name.clone(),
            module: self.module.clone(),
            workspace: self.workspace.clone(),
            workspace_path: self.workspace_path.clone(),
            relative_to_workspace: self
                .path
                .clone()
                .unwrap_or_else(|| format!("{}/{}", self.module, self.name)),
        }
    }
}

/// Run configuration.
#[derive(Args, Clone)]
pub struct RunConfig {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// AWS region to report to clients, overriding the service settings.
    #[arg(short = 'r', long)]
    pub region: Option<String>,

    /// Seconds to wait for DynamoDB to answer after the container starts.
    #[arg(long, default_value_t = 30)]
    pub ready_timeout_secs: u64,
}
