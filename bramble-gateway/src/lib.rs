//! The Bramble gateway runtime.
//!
//! Wires the federation core to the network: polls downstream schemas,
//! keeps the merged snapshot fresh, executes query plans against the
//! services, stitches the partial results, and serves the public GraphQL
//! endpoint.

pub mod config;
pub mod downstream;
pub mod executor;
pub mod gateway;
pub mod graphql;
pub mod hooks;
pub mod json_ext;
pub mod poller;
pub mod server;
pub mod stitch;
pub mod supervisor;

pub use config::Configuration;
pub use gateway::Gateway;
pub use gateway::Snapshot;
