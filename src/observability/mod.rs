//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters and gauges via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `offload_plugins_loaded` | Counter | Plugins accepted at discovery |
//! | `offload_plugins_rejected` | Counter | Plugins that failed to load or initialize |
//! | `offload_devices_initialized` | Counter | Devices added to the registry |
//! | `offload_device_init_failures` | Counter | Devices skipped at activation |
//! | `offload_images_registered` | Counter | Images bound to a plugin |
//! | `offload_images_unbound` | Counter | Images no plugin recognized |
//! | `offload_destructors_run` | Counter | Global destructors issued |
//! | `offload_devices` | Gauge | Device registry size |
//!
//! Device initialization failures are reported only through this channel and
//! the `warn` log; the registry simply exposes fewer devices.

mod metrics;
mod tracing_support;

pub use metrics::{
    init_metrics, record_destructors_run, record_device_init_failure, record_devices_initialized,
    record_image_registered, record_image_unbound, record_plugin_loaded, record_plugin_rejected,
};
pub use tracing_support::{instrument_registration, span_plugin, span_registration};
