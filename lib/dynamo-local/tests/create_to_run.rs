//! End-to-end run against a real Docker daemon.
//!
//! Run with `cargo test -p dynamo-local --test create_to_run -- --ignored`.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dynamo_local::{
    builder::{self, Builder, CreationMode},
    client::LocalClient,
    configuration::{
        extract_configuration, Configuration, ConfigurationInformation, RuntimeContext, DYNAMODB, ENDPOINT_KEY,
        REGION_KEY,
    },
    docker::DockerContainerRuntime,
    identity::{Environment, ServiceIdentity, Workspace},
    network::NetworkManager,
    runtime::{self, InitRequest, Runtime, RuntimeState},
    service::ServiceBase,
    templates::EmbeddedTemplates,
};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Docker daemon"]
async fn create_to_run() {
    let workspace_dir = tempfile::tempdir().unwrap();
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
    let identity = ServiceIdentity {
        name: format!("svc-{}", millis),
        module: "mod".to_string(),
        workspace: "test".to_string(),
        workspace_path: workspace_dir.path().to_path_buf(),
        relative_to_workspace: format!("mod/svc-{}", millis),
    };
    let base = ServiceBase::new(Arc::new(EmbeddedTemplates::bundled()));

    let mut service_builder = Builder::new(base.clone());
    let mut request = builder::LoadRequest::new(identity.clone()).with_creation_mode(CreationMode::default());
    request.disable_catch = true;
    service_builder.load(request).await.unwrap();
    service_builder.create().await.unwrap();

    let environment = Environment::local();
    let runtime = Runtime::new(base, Arc::new(DockerContainerRuntime::connect().unwrap()));
    let mut request = runtime::LoadRequest::new(identity.clone(), environment.clone());
    request.disable_catch = true;
    let loaded = runtime.load(request).await.unwrap();

    let mappings = NetworkManager::new()
        .with_temporary_ports()
        .generate_network_mappings(
            &environment,
            &Workspace::new(identity.workspace.as_str()),
            &identity,
            &loaded.endpoints,
        )
        .unwrap();
    assert_eq!(mappings.len(), 1);
    let port = mappings[0].port;

    let init = runtime
        .init(InitRequest {
            runtime_context: RuntimeContext::Native,
            configuration: Some(
                Configuration::new("test", RuntimeContext::Native)
                    .with_info(ConfigurationInformation::new(DYNAMODB).with_value(REGION_KEY, "us-east-2")),
            ),
            proposed_network_mappings: mappings,
        })
        .await
        .unwrap();

    let native = extract_configuration(&init.runtime_configurations, RuntimeContext::Native).unwrap();
    assert_eq!(native.get_value(DYNAMODB, REGION_KEY).unwrap(), "us-east-2");
    let endpoint = native.get_value(DYNAMODB, ENDPOINT_KEY).unwrap();
    assert_eq!(endpoint, format!("http://localhost:{}", port));

    let started = runtime.start().await;
    let smoke = match &started {
        Ok(()) => {
            let client = LocalClient::new("us-east-2", endpoint).unwrap();
            Some(client.wait_for_tables(Duration::from_secs(60)).await)
        }
        Err(_) => None,
    };

    runtime.destroy().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Destroyed);

    started.unwrap();
    let tables = smoke.unwrap().unwrap();
    assert!(tables.is_empty());
}
