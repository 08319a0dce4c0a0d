//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Decision engine (fail-open decisions against a stream store)
//! - Expiration sweeper (removal and reporting of idle streams)
//! - Backend health (circuit breaker and throttled diagnostics)
//! - Trigger API and declarative configuration
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod config;
pub mod engine;
pub mod health;
pub mod metrics;
pub mod ports;
pub mod sweeper;
pub mod trigger;
