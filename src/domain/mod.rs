//! Domain layer - pure business logic with no external dependencies.
//!
//! This layer contains the core concepts and invariants of stream rate limiting:
//! - Timestamps comparable across processes
//! - Policies, per-call overrides and decisions
//! - The per-stream suppression state machine
//! - Suppression summaries and their templates
//!
//! All types in this layer are pure and easily testable.

pub mod policy;
pub mod stream;
pub mod summary;
pub mod time;
