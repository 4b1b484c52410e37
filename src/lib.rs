//! Opflow: Remote Execution Coordinator
//!
//! A coordination service that lets a remote client drive tensor-computation
//! operations on a worker's local devices: isolated execution contexts, an
//! operation queue with explicit dependencies, reference-counted output
//! handles, and keep-alive garbage collection of abandoned sessions.

pub mod config;
pub mod context;
pub mod devices;
pub mod engine;
pub mod error;
pub mod functions;
pub mod handles;
pub mod logging;
pub mod queue;
pub mod service;
pub mod types;
