//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Messages**: upstream messages received, relayed, and dropped
//! - **Connections**: upstream connection state and downstream subscribers
//! - **Credentials**: token refresh outcomes
//! - **Commands**: subscriber commands by type
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the relay HTTP port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns `BuildError` if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "upstox_relay_messages_received_total",
        "Total messages received from the upstream feed"
    );
    describe_counter!(
        "upstox_relay_messages_relayed_total",
        "Total message deliveries to downstream subscribers"
    );
    describe_counter!(
        "upstox_relay_messages_dropped_total",
        "Total deliveries skipped because a subscriber buffer was full"
    );

    describe_gauge!(
        "upstox_relay_subscribers",
        "Number of registered downstream subscribers"
    );
    describe_gauge!(
        "upstox_relay_upstream_connected",
        "1 when the upstream session is open, 0 otherwise"
    );
    describe_counter!(
        "upstox_relay_reconnects_total",
        "Total scheduled upstream reconnects"
    );

    describe_counter!(
        "upstox_relay_token_refreshes_total",
        "Token refresh attempts by outcome"
    );
    describe_counter!(
        "upstox_relay_subscriber_commands_total",
        "Subscriber commands by type"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a message received from the upstream feed.
pub fn record_message_received() {
    counter!("upstox_relay_messages_received_total").increment(1);
}

/// Record deliveries to downstream subscribers.
pub fn record_messages_relayed(count: u64) {
    counter!("upstox_relay_messages_relayed_total").increment(count);
}

/// Record deliveries skipped for slow subscribers.
pub fn record_messages_dropped(count: u64) {
    counter!("upstox_relay_messages_dropped_total").increment(count);
}

/// Update the downstream subscriber count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(count: usize) {
    gauge!("upstox_relay_subscribers").set(count as f64);
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("upstox_relay_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a scheduled upstream reconnect.
pub fn record_reconnect() {
    counter!("upstox_relay_reconnects_total").increment(1);
}

/// Record a token refresh attempt.
pub fn record_token_refresh(outcome: &'static str) {
    counter!("upstox_relay_token_refreshes_total", "outcome" => outcome).increment(1);
}

/// Record a subscriber command.
pub fn record_subscriber_command(command: &'static str) {
    counter!("upstox_relay_subscriber_commands_total", "command" => command).increment(1);
}
