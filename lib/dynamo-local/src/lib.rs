//! Local, disposable DynamoDB instances for development and tests.
//!
//! A host drives two components through fixed lifecycles:
//!
//! - the [`Builder`][builder::Builder] scaffolds a service and declares its endpoints
//! - the [`Runtime`][runtime::Runtime] runs an instance of it in a container, and produces the
//!   [`Configuration`][configuration::Configuration] downstream services use to connect
//!
//! Host ports are negotiated by the [`NetworkManager`][network::NetworkManager] between the two.

pub mod builder;
pub mod catch;
pub mod client;
pub mod config;
pub mod configuration;
pub mod container;
pub mod docker;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod network;
pub mod runtime;
pub mod service;
pub mod templates;
