//! Metrics sink: out of scope beyond this trait. The one relay-specific counter is
//! `record_payment_relay_failed(failure_class_name, RelayType=Trampoline)`; the `RelayType` tag
//! is kept as a real enum (rather than a hardcoded string) so a future channel relay could share
//! the same sink without changing its signature.
//!
//! The coordinator's own entry points are additionally instrumented with `#[autometrics]`, the
//! same attribute applied to the rest of the node's public methods.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayType {
    Trampoline,
}

impl RelayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayType::Trampoline => "trampoline",
        }
    }
}

#[async_trait]
pub trait RelayMetrics: Send + Sync {
    fn record_payment_relay_failed(&self, failure_class_name: &str, relay_type: RelayType);
}
