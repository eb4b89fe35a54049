//! Metrics collection using metrics-rs.

use metrics::{Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const PLUGINS_LOADED: &str = "offload_plugins_loaded";
const PLUGINS_REJECTED: &str = "offload_plugins_rejected";
const DEVICES_INITIALIZED: &str = "offload_devices_initialized";
const DEVICE_INIT_FAILURES: &str = "offload_device_init_failures";
const IMAGES_REGISTERED: &str = "offload_images_registered";
const IMAGES_UNBOUND: &str = "offload_images_unbound";
const DESTRUCTORS_RUN: &str = "offload_destructors_run";
const DEVICES: &str = "offload_devices";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(PLUGINS_LOADED, Unit::Count, "Plugins accepted at discovery");
    metrics::describe_counter!(
        PLUGINS_REJECTED,
        Unit::Count,
        "Plugins that failed to load or initialize"
    );
    metrics::describe_counter!(
        DEVICES_INITIALIZED,
        Unit::Count,
        "Devices added to the device registry"
    );
    metrics::describe_counter!(
        DEVICE_INIT_FAILURES,
        Unit::Count,
        "Devices skipped because their initialization failed"
    );
    metrics::describe_counter!(
        IMAGES_REGISTERED,
        Unit::Count,
        "Device images bound to a plugin"
    );
    metrics::describe_counter!(
        IMAGES_UNBOUND,
        Unit::Count,
        "Device images no plugin recognized"
    );
    metrics::describe_counter!(
        DESTRUCTORS_RUN,
        Unit::Count,
        "Global destructors issued at unregistration"
    );
    metrics::describe_gauge!(DEVICES, Unit::Count, "Size of the device registry");
}

/// Record a plugin accepted at discovery.
#[inline]
pub fn record_plugin_loaded(plugin: &str) {
    counter!(PLUGINS_LOADED, "plugin" => plugin.to_string()).increment(1);
}

/// Record a plugin rejected at discovery.
#[inline]
pub fn record_plugin_rejected(plugin: &str) {
    counter!(PLUGINS_REJECTED, "plugin" => plugin.to_string()).increment(1);
}

/// Record devices initialized by a plugin and the new registry size.
#[inline]
pub fn record_devices_initialized(plugin: &str, count: usize, registry_size: usize) {
    counter!(DEVICES_INITIALIZED, "plugin" => plugin.to_string()).increment(count as u64);
    gauge!(DEVICES).set(registry_size as f64);
}

/// Record a device skipped during plugin activation.
#[inline]
pub fn record_device_init_failure(plugin: &str) {
    counter!(DEVICE_INIT_FAILURES, "plugin" => plugin.to_string()).increment(1);
}

/// Record an image bound to a plugin.
#[inline]
pub fn record_image_registered(plugin: &str) {
    counter!(IMAGES_REGISTERED, "plugin" => plugin.to_string()).increment(1);
}

/// Record an image no plugin accepted.
#[inline]
pub fn record_image_unbound() {
    counter!(IMAGES_UNBOUND).increment(1);
}

/// Record destructors issued on one device.
#[inline]
pub fn record_destructors_run(plugin: &str, count: usize) {
    counter!(DESTRUCTORS_RUN, "plugin" => plugin.to_string()).increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics();
        init_metrics();
        assert!(METRICS_INITIALIZED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_record_without_recorder() {
        // No recorder installed: recording is a no-op.
        record_plugin_loaded("test");
        record_devices_initialized("test", 2, 2);
        record_image_unbound();
    }
}
