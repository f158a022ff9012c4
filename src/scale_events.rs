//! Scale lifecycle event stamping
//!
//! Records completed scale transitions on a function's status document so
//! the scaler subsystem can observe when capacity changes took effect.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::crd::{FunctionStatus, ScaleEvent, ScaleToZeroStatus};

/// Source of timestamps; injectable so tests can pin the clock.
pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        Utc::now().to_rfc3339()
    }
}

/// Stamps scale lifecycle events onto status documents.
pub struct ScaleEventSink {
    clock: Arc<dyn Clock>,
}

impl ScaleEventSink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Record `event` as the last completed scale transition.
    pub fn stamp(&self, status: &mut FunctionStatus, event: ScaleEvent) {
        debug!(event = ?event, "Stamping scale event");

        status.scale_to_zero = Some(ScaleToZeroStatus {
            last_scale_event: event,
            last_scale_event_time: Some(self.clock.now_rfc3339()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub struct FixedClock(pub &'static str);

    impl Clock for FixedClock {
        fn now_rfc3339(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn test_stamp_records_event_and_time() {
        let sink = ScaleEventSink::new(Arc::new(FixedClock("2024-06-01T12:00:00+00:00")));
        let mut status = FunctionStatus::default();

        sink.stamp(&mut status, ScaleEvent::ScaleToZeroCompleted);

        let scale = status.scale_to_zero.unwrap();
        assert_eq!(scale.last_scale_event, ScaleEvent::ScaleToZeroCompleted);
        assert_eq!(
            scale.last_scale_event_time.as_deref(),
            Some("2024-06-01T12:00:00+00:00")
        );
    }

    #[test]
    fn test_stamp_overwrites_previous_event() {
        let sink = ScaleEventSink::new(Arc::new(FixedClock("2024-06-01T12:00:00+00:00")));
        let mut status = FunctionStatus::default();

        sink.stamp(&mut status, ScaleEvent::ScaleFromZeroCompleted);
        sink.stamp(&mut status, ScaleEvent::ResourceUpdated);

        assert_eq!(
            status.scale_to_zero.unwrap().last_scale_event,
            ScaleEvent::ResourceUpdated
        );
    }

    #[test]
    fn test_system_clock_produces_rfc3339() {
        let now = SystemClock.now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
