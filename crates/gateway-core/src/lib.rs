//! Registry store, scope policy and authorization engine for the MCP
//! gateway: the domain model and pure/local-I/O components (C1, C3,
//! C4, C9) that the rest of the gateway is built around.

pub mod audit;
pub mod authz;
pub mod config;
pub mod error;
pub mod model;
pub mod repository;
pub mod scope;
