//! ChainReactor metrics definitions.
//!
//! OpenTelemetry counters, taken from the global meter provider. Until the
//! application installs a provider every instrument is a no-op.
//!
//! - `chainreactor.events_skipped`: tagged with consumer
//! - `chainreactor.tasks_dead_lettered`: tagged with rule + action
//! - `chainreactor.alarms_raised`: tagged with kind
//! - `chainreactor.actions_succeeded`: tagged with action

use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};

use crate::alarm::AlarmKind;

/// Meter name used by [`ReactorMetrics::global`].
pub const METER_NAME: &str = "chainreactor";

/// Central metrics handle for ChainReactor components.
#[derive(Clone)]
pub struct ReactorMetrics {
    pub events_skipped: Counter<u64>,
    pub tasks_dead_lettered: Counter<u64>,
    pub alarms_raised: Counter<u64>,
    pub actions_succeeded: Counter<u64>,
}

impl ReactorMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            events_skipped: meter
                .u64_counter("chainreactor.events_skipped")
                .with_description("Events a consumer skipped as unknown, malformed, or diverged")
                .build(),
            tasks_dead_lettered: meter
                .u64_counter("chainreactor.tasks_dead_lettered")
                .with_description("Action tasks moved to the dead-letter state")
                .build(),
            alarms_raised: meter
                .u64_counter("chainreactor.alarms_raised")
                .with_description("Operator alarms recorded")
                .build(),
            actions_succeeded: meter
                .u64_counter("chainreactor.actions_succeeded")
                .with_description("Action tasks completed by their sink")
                .build(),
        }
    }

    /// Instruments from the process-wide meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(METER_NAME))
    }

    pub fn record_skipped(&self, consumer: &str) {
        self.events_skipped
            .add(1, &[KeyValue::new("consumer", consumer.to_string())]);
    }

    pub fn record_dead_lettered(&self, rule: &str, action: &str) {
        self.tasks_dead_lettered.add(
            1,
            &[
                KeyValue::new("rule", rule.to_string()),
                KeyValue::new("action", action.to_string()),
            ],
        );
    }

    pub fn record_alarm(&self, kind: AlarmKind) {
        self.alarms_raised.add(1, &[KeyValue::new("kind", kind.as_str())]);
    }

    pub fn record_succeeded(&self, action: &str) {
        self.actions_succeeded
            .add(1, &[KeyValue::new("action", action.to_string())]);
    }
}

impl Default for ReactorMetrics {
    fn default() -> Self {
        Self::global()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_provider_is_a_noop() {
        let metrics = ReactorMetrics::global();
        metrics.record_skipped("projector");
        metrics.record_dead_lettered("r1", "webhook");
        metrics.record_alarm(AlarmKind::ReorgDepthExceeded);
        metrics.record_succeeded("notification");
        let cloned = metrics.clone();
        cloned.record_skipped("trigger-engine");
    }
}
