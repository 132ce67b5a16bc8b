use std::{sync::Arc, time::Duration};

use clap::Parser as _;
use dynamo_local::{
    builder::{self, Builder, CreationMode},
    client::LocalClient,
    config::AgentConfiguration,
    configuration::{
        extract_configuration, Configuration, ConfigurationInformation, RuntimeContext, DYNAMODB, ENDPOINT_KEY,
        REGION_KEY,
    },
    error::{ErrorContext as _, GenericError},
    identity::{Environment, Workspace},
    runtime::{self, InitRequest, Runtime},
    service::ServiceBase,
    templates::{EmbeddedTemplates, TemplateStore},
};
use tracing::{error, info};

mod config;
use self::config::{Action, Cli, RunConfig, ServiceArgs};

mod logging;
use self::logging::{fatal_and_exit, initialize_logging};

/// Origin of the overrides passed from the command line.
const CLI_ORIGIN: &str = "cli";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    if let Err(e) = run(cli).await {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    let config = AgentConfiguration::load(cli.config.as_deref()).error_context("Failed to load configuration.")?;
    let templates: Arc<dyn TemplateStore> = Arc::new(EmbeddedTemplates::bundled());
    let base = config.service_base(templates);

    match cli.action {
        Action::Create(args) => create(base, args).await,
        Action::Run(run_config) => run_service(&config, base, run_config).await,
        Action::Info => {
            let information = base.agent_information()?;
            println!("{}", serde_json::to_string_pretty(&information)?);
            Ok(())
        }
    }
}

async fn create(base: ServiceBase, args: ServiceArgs) -> Result<(), GenericError> {
    let identity = args.identity();
    info!(service = %identity, "Creating service...");

    let mut service_builder = Builder::new(base);
    let loaded = service_builder
        .load(builder::LoadRequest::new(identity.clone()).with_creation_mode(CreationMode::default()))
        .await?;
    let created = service_builder.create().await?;

    info!(
        service = %identity,
        endpoints = created.endpoints.len(),
        "Created service in {}.",
        identity.service_dir().display()
    );
    if let Some(getting_started) = loaded.getting_started {
        println!("{}", getting_started);
    }

    Ok(())
}

async fn run_service(config: &AgentConfiguration, base: ServiceBase, run_config: RunConfig) -> Result<(), GenericError> {
    let identity = run_config.service.identity();
    let environment = Environment::local();
    let containers = Arc::new(config.container_runtime()?);

    let runtime = Runtime::new(base, containers);
    let loaded = runtime
        .load(runtime::LoadRequest::new(identity.clone(), environment.clone()))
        .await?;

    let mappings = config.network_manager().generate_network_mappings(
        &environment,
        &Workspace::new(identity.workspace.as_str()),
        &identity,
        &loaded.endpoints,
    )?;

    let overrides = run_config.region.map(|region| {
        Configuration::new(CLI_ORIGIN, RuntimeContext::Native)
            .with_info(ConfigurationInformation::new(DYNAMODB).with_value(REGION_KEY, region))
    });
    let init = runtime
        .init(InitRequest {
            runtime_context: RuntimeContext::Native,
            configuration: overrides,
            proposed_network_mappings: mappings,
        })
        .await?;
    let native = extract_configuration(&init.runtime_configurations, RuntimeContext::Native)?.clone();

    let result = serve(&runtime, &native, Duration::from_secs(run_config.ready_timeout_secs)).await;

    info!(service = %identity, "Tearing down...");
    runtime.destroy().await?;

    result
}

async fn serve(runtime: &Runtime, native: &Configuration, ready_timeout: Duration) -> Result<(), GenericError> {
    runtime.start().await?;

    let client = LocalClient::new(
        native.get_value(DYNAMODB, REGION_KEY)?,
        native.get_value(DYNAMODB, ENDPOINT_KEY)?,
    )?;
    let tables = client.wait_for_tables(ready_timeout).await?;
    info!(endpoint = client.endpoint(), tables = tables.len(), "DynamoDB is ready.");

    println!("{}", serde_json::to_string_pretty(native)?);

    info!("Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to listen for Ctrl-C.")?;

    Ok(())
}
