use crate::resources::ResourceKind;
use core::time::Duration;
use giobridge_proto::Direction;
use metrics::{counter, gauge, histogram};

pub fn observe_transfer(direction: Direction, bytes: usize, dur: Duration) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    if direction.reads() {
        counter!("giobridge_xfer_read_count").increment(1);
        counter!("giobridge_xfer_read_bytes").increment(bytes as u64);
        histogram!("giobridge_xfer_read_latency_ns").record(ns as f64);
    } else if direction.writes() {
        counter!("giobridge_xfer_write_count").increment(1);
        counter!("giobridge_xfer_write_bytes").increment(bytes as u64);
        histogram!("giobridge_xfer_write_latency_ns").record(ns as f64);
    } else {
        counter!("giobridge_xfer_control_count").increment(1);
        histogram!("giobridge_xfer_control_latency_ns").record(ns as f64);
    }
}

pub fn record_contexts_in_use(count: usize) {
    gauge!("giobridge_contexts_in_use").set(count as f64);
}

pub fn record_resource_alloc(kind: ResourceKind) {
    counter!("giobridge_resource_alloc_count", "kind" => kind.as_str()).increment(1);
}

pub fn record_fake_ack() {
    counter!("giobridge_fake_ack_count").increment(1);
}

pub fn record_detached_completion() {
    counter!("giobridge_completion_without_waiter_count").increment(1);
}

pub fn record_stray_completion() {
    counter!("giobridge_stray_completion_count").increment(1);
}

pub fn record_bind() {
    counter!("giobridge_bind_count").increment(1);
}

pub fn record_unbind() {
    counter!("giobridge_unbind_count").increment(1);
}
