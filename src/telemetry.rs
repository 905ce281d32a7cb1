use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Telemetry {
    signal_errors: AtomicU64,
    egress_exhaustions: AtomicU64,
    ws_queue_pressure_events: AtomicU64,
    devices_reaped: AtomicU64,
}

impl Telemetry {
    pub fn inc_signal_error(&self) {
        self.signal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_egress_exhaustion(&self) {
        self.egress_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ws_queue_pressure(&self) {
        self.ws_queue_pressure_events
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_devices_reaped(&self) {
        self.devices_reaped.fetch_add(1, Ordering::Relaxed);
    }
}
