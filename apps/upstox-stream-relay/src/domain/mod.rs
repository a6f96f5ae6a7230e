//! Domain Layer - Core relay types and business rules.
//!
//! This layer contains the credential, subscription, and relay message types
//! with no I/O. All types here are plain Rust with serialization support.

/// Access/refresh credential with absolute expiry.
pub mod credential;

/// Relay envelopes and subscriber command/reply types.
pub mod streaming;

/// Subscription requests and restore tracking.
pub mod subscription;
