//! Prometheus-compatible counters/gauges at the seams that matter
//! operationally: slot usage, fetch/push throughput, cancellations.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub fn set_slots_in_use(function_id: &str, active: u32) {
    gauge!("icm_slots_in_use", "function_id" => function_id.to_string()).set(active as f64);
}

pub fn set_slots_capacity(function_id: &str, capacity: u32) {
    gauge!("icm_slots_capacity", "function_id" => function_id.to_string()).set(capacity as f64);
}

pub fn record_input_fetched(function_id: &str, batch_size: usize) {
    counter!("icm_inputs_fetched_total", "function_id" => function_id.to_string()).increment(batch_size as u64);
}

pub fn record_fetch_latency(function_id: &str, duration: Duration) {
    histogram!("icm_fetch_duration_seconds", "function_id" => function_id.to_string()).record(duration.as_secs_f64());
}

pub fn record_output_pushed(function_id: &str, status: &str) {
    counter!(
        "icm_outputs_pushed_total",
        "function_id" => function_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_cancellation_observed(function_id: &str) {
    counter!("icm_cancellations_total", "function_id" => function_id.to_string()).increment(1);
}

pub fn record_heartbeat_failure(function_id: &str) {
    counter!("icm_heartbeat_failures_total", "function_id" => function_id.to_string()).increment(1);
}
