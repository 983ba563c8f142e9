//! # palisade-gateway
//!
//! HTTP surface and validation orchestrator for the Palisade authorization
//! gateway.
//!
//! The binary wires the core components together and serves the REST API:
//! manifest validation (the hot path), seal verification and execution
//! marking, audit queries, and organization/agent registration. The library
//! half exists so integration tests can drive the exact router the binary
//! serves.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod error;
pub mod orchestrator;
pub mod routes;
pub mod state;

pub use error::{ApiError, ErrorCode};
pub use state::AppState;
