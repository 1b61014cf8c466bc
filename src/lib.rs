//! Execution engine for containerized microservices: validates caller input
//! against a descriptor, provisions a Docker container and invokes the
//! requested action through a command line, an HTTP call or an event
//! subscription.

pub mod coerce;
pub mod config;
pub mod docker;
pub mod error;
pub mod exec;
pub mod http;
pub mod models;
pub mod ports;
pub mod reporter;
pub mod state;
pub mod validate;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::{ErrorKind, ExecError, Failure};
pub use exec::{Engine, ExecRequest, Invocation};
pub use models::Microservice;
