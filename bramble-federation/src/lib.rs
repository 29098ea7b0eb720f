//! Schema-level machinery for the Bramble federation gateway.
//!
//! This crate is pure: it parses nothing off the network and holds no locks.
//! It validates downstream schemas against the gateway conventions, merges
//! them into one graph with the derived routing tables, filters operations
//! and schemas by permission trees, plans operations into per-service steps,
//! and answers introspection from the merged schema. The gateway crate wires
//! these pieces to HTTP.

pub mod auth;
pub mod directives;
pub mod error;
pub mod format;
pub mod introspection;
pub mod merge;
pub mod plan;
pub mod validate;

pub use error::MergeError;
pub use error::PlanError;
pub use error::SchemaError;
pub use merge::merge_schemas;
pub use merge::BoundaryQuery;
pub use merge::MergedSchema;
pub use merge::ServiceSchema;
pub use merge::GATEWAY_URL;
pub use plan::plan_operation;
pub use plan::PlanStep;
pub use plan::QueryPlan;
pub use validate::validate_service_schema;
