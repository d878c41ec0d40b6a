// src/core/metrics.rs

//! Per-node Prometheus metrics: counters for events processed by kind and
//! gauges for the current epoch and storage-roster size, gathered through
//! this node's own `Registry` rather than the process-wide default one.
//!
//! The teacher's metrics module registers into the global default registry
//! via `lazy_static`, which is correct for a single long-lived server
//! process. Here, integration tests (`tests/restart_scenarios.rs`) run
//! several simulated cluster nodes in one process, so each `Metrics`
//! instance owns a private `Registry` instead -- two nodes' counters must
//! never be conflated just because they share an address space.

use prometheus::{Counter, Gauge, Opts, Registry, TextEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub view_joins: u64,
    pub view_leaves: u64,
    pub notifies: u64,
    pub requests_dispatched: u64,
    pub requests_fast_failed: u64,
    pub self_fences: u64,
    pub current_epoch: u32,
    pub storage_roster_size: u32,
}

pub struct Metrics {
    registry: Registry,
    view_joins: Counter,
    view_leaves: Counter,
    notifies: Counter,
    requests_dispatched: Counter,
    requests_fast_failed: Counter,
    self_fences: Counter,
    current_epoch: Gauge,
    storage_roster_size: Gauge,
}

fn counter(name: &str, help: &str) -> Counter {
    Counter::with_opts(Opts::new(name, help)).expect("static metric options are always valid")
}

fn gauge(name: &str, help: &str) -> Gauge {
    Gauge::with_opts(Opts::new(name, help)).expect("static metric options are always valid")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let view_joins = counter(
            "vdiclusterd_view_joins_total",
            "Total number of view-join events processed.",
        );
        let view_leaves = counter(
            "vdiclusterd_view_leaves_total",
            "Total number of view-leave events processed.",
        );
        let notifies = counter(
            "vdiclusterd_notifies_total",
            "Total number of notify events processed.",
        );
        let requests_dispatched = counter(
            "vdiclusterd_requests_dispatched_total",
            "Total number of client requests dispatched to I/O or the gateway.",
        );
        let requests_fast_failed = counter(
            "vdiclusterd_requests_fast_failed_total",
            "Total number of direct requests fast-failed while this node's own join was in flight.",
        );
        let self_fences = counter(
            "vdiclusterd_self_fences_total",
            "Total number of times this node self-fenced on a minority partition.",
        );
        let current_epoch = gauge("vdiclusterd_current_epoch", "This node's current cluster epoch.");
        let storage_roster_size = gauge(
            "vdiclusterd_storage_roster_size",
            "Number of nodes currently in this node's storage roster.",
        );

        registry
            .register(Box::new(view_joins.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(view_leaves.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(notifies.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(requests_dispatched.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(requests_fast_failed.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(self_fences.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(current_epoch.clone()))
            .expect("each metric name is registered exactly once per instance");
        registry
            .register(Box::new(storage_roster_size.clone()))
            .expect("each metric name is registered exactly once per instance");

        Self {
            registry,
            view_joins,
            view_leaves,
            notifies,
            requests_dispatched,
            requests_fast_failed,
            self_fences,
            current_epoch,
            storage_roster_size,
        }
    }

    pub fn record_view_join(&self) {
        self.view_joins.inc();
    }

    pub fn record_view_leave(&self) {
        self.view_leaves.inc();
    }

    pub fn record_notify(&self) {
        self.notifies.inc();
    }

    pub fn record_dispatch(&self) {
        self.requests_dispatched.inc();
    }

    pub fn record_fast_fail(&self) {
        self.requests_fast_failed.inc();
    }

    pub fn record_self_fence(&self) {
        self.self_fences.inc();
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.current_epoch.set(epoch as f64);
    }

    pub fn set_storage_roster_size(&self, size: u32) {
        self.storage_roster_size.set(size as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            view_joins: self.view_joins.get() as u64,
            view_leaves: self.view_leaves.get() as u64,
            notifies: self.notifies.get() as u64,
            requests_dispatched: self.requests_dispatched.get() as u64,
            requests_fast_failed: self.requests_fast_failed.get() as u64,
            self_fences: self.self_fences.get() as u64,
            current_epoch: self.current_epoch.get() as u32,
            storage_roster_size: self.storage_roster_size.get() as u32,
        }
    }

    /// Encodes this node's metrics in Prometheus text exposition format,
    /// for a caller to serve over whatever outer HTTP surface it wires up.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .expect("text encoding of a valid metric family never fails")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.view_joins, 0);
        assert_eq!(snap.current_epoch, 0);
    }

    #[test]
    fn recorded_events_show_up_in_the_snapshot() {
        let metrics = Metrics::new();
        metrics.record_view_join();
        metrics.record_dispatch();
        metrics.record_dispatch();
        metrics.set_epoch(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.view_joins, 1);
        assert_eq!(snap.requests_dispatched, 2);
        assert_eq!(snap.current_epoch, 3);
    }

    #[test]
    fn two_instances_do_not_share_counters() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.record_view_join();
        assert_eq!(a.snapshot().view_joins, 1);
        assert_eq!(b.snapshot().view_joins, 0);
    }

    #[test]
    fn gather_encodes_prometheus_text_format() {
        let metrics = Metrics::new();
        metrics.record_self_fence();
        let text = metrics.gather();
        assert!(text.contains("vdiclusterd_self_fences_total"));
    }
}
