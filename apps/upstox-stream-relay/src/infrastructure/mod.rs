//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstox adapters (OAuth, market data feed, LTP quotes).
pub mod upstox;

/// Downstream subscriber fan-out.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// HTTP and WebSocket server.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// SQLite credential store.
pub mod store;

/// OpenTelemetry tracing integration.
pub mod telemetry;
