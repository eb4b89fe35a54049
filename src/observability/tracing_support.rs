//! Tracing integration for structured logging and spans.

use crate::image::HostEntryRange;
use tracing::{Level, Span, span};

/// Create a span covering the lifetime of one plugin operation.
///
/// # Example
///
/// ```rust,ignore
/// use offload::observability::span_plugin;
///
/// let _guard = span_plugin("omptarget.rtl.x86_64").entered();
/// ```
#[inline]
pub fn span_plugin(name: &str) -> Span {
    span!(Level::DEBUG, "plugin", name = %name)
}

/// Create a span for registering or unregistering a program.
#[inline]
pub fn span_registration(op: &'static str, range: HostEntryRange) -> Span {
    span!(Level::DEBUG, "registration", op = op, program = %range)
}

/// Enter a registration span.
pub fn instrument_registration(
    op: &'static str,
    range: HostEntryRange,
) -> tracing::span::EnteredSpan {
    span_registration(op, range).entered()
}
