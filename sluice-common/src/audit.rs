//! Audit logging for entry lifecycle events
//!
//! Every entry that passes through a destination produces a trail of audit
//! events, emitted through `tracing` at a fixed target so that they can be
//! routed separately from operational logs.
//!
//! ## Audit Events
//!
//! - `EntryAccepted`: Entry published to a destination and stored
//! - `EntryDelivered`: Entry handed to the destination's transport
//! - `DeliveryFailed`: Transport rejected the entry, which was requeued
//! - `EntryDestroyed`: Entry discarded by policy or because it expired
//! - `EntryLost`: Non-persistent entry dropped after a failed swap-out

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging for entry lifecycle events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replace destination names with a fixed marker
    #[serde(default)]
    pub redact_destination: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_destination: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: std::sync::OnceLock<Arc<AuditConfig>> = std::sync::OnceLock::new();

/// Initialize audit logging with configuration
///
/// Only the first call takes effect.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

/// Get the current audit configuration
#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

#[must_use]
pub fn redact_destination(destination: &str, redact: bool) -> String {
    if redact {
        "[REDACTED]".to_string()
    } else {
        destination.to_string()
    }
}

/// Log entry accepted event
///
/// # Fields
/// - `destination`: Destination the entry was published to
/// - `entry_id`: Unique entry identifier
/// - `priority`: Entry priority (0-9)
/// - `size`: Accounted size in bytes
/// - `persistent`: Whether the entry survives a restart
pub fn log_entry_accepted(
    destination: &str,
    entry_id: u64,
    priority: u8,
    size: usize,
    persistent: bool,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "sluice::audit",
        tracing::Level::INFO,
        event = "EntryAccepted",
        destination = %redact_destination(destination, config.redact_destination),
        entry_id = entry_id,
        priority = priority,
        size = size,
        persistent = persistent,
        "Audit: Entry accepted"
    );
}

/// Log entry delivered event
pub fn log_entry_delivered(destination: &str, entry_id: u64, priority: u8) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "sluice::audit",
        tracing::Level::INFO,
        event = "EntryDelivered",
        destination = %redact_destination(destination, config.redact_destination),
        entry_id = entry_id,
        priority = priority,
        "Audit: Entry delivered"
    );
}

/// Log delivery failure event
///
/// Logged when the transport rejects an entry. The entry itself stays queued.
pub fn log_delivery_failed(destination: &str, entry_id: u64, error: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "sluice::audit",
        tracing::Level::WARN,
        event = "DeliveryFailed",
        destination = %redact_destination(destination, config.redact_destination),
        entry_id = entry_id,
        error = %error,
        "Audit: Delivery failed"
    );
}

/// Log entry destroyed event
///
/// # Fields
/// - `reason`: Why the entry was discarded (`policy` or `expired`)
pub fn log_entry_destroyed(destination: &str, entry_id: u64, priority: u8, reason: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "sluice::audit",
        tracing::Level::INFO,
        event = "EntryDestroyed",
        destination = %redact_destination(destination, config.redact_destination),
        entry_id = entry_id,
        priority = priority,
        reason = %reason,
        "Audit: Entry destroyed"
    );
}

/// Log entry lost event
pub fn log_entry_lost(destination: &str, entry_id: u64) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        target: "sluice::audit",
        tracing::Level::ERROR,
        event = "EntryLost",
        destination = %redact_destination(destination, config.redact_destination),
        entry_id = entry_id,
        "Audit: Entry lost"
    );
}
