#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds in microseconds, with their exposition labels.
const BUCKETS: [(u64, &str); 8] = [
    (100, "0.0001"),
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (1_000_000, "1"),
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (slot, (bound, _)) in self.buckets.iter().zip(BUCKETS) {
            if us <= bound {
                slot.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (slot, (_, label)) in self.buckets.iter().zip(BUCKETS) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", slot.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Monotonic counters exported as `meetsignal_<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ConnectionsTotal,
    MessagesReceived,
    MessagesSent,
    Errors,
    RoomsCreated,
    Joins,
    Leaves,
    SignalsRelayed,
    ChatMessages,
    DeliveriesDropped,
}

impl Counter {
    const ALL: [Counter; 10] = [
        Counter::ConnectionsTotal,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::Joins,
        Counter::Leaves,
        Counter::SignalsRelayed,
        Counter::ChatMessages,
        Counter::DeliveriesDropped,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::ConnectionsTotal => "connections_total",
            Counter::MessagesReceived => "messages_received_total",
            Counter::MessagesSent => "messages_sent_total",
            Counter::Errors => "errors_total",
            Counter::RoomsCreated => "rooms_created_total",
            Counter::Joins => "joins_total",
            Counter::Leaves => "leaves_total",
            Counter::SignalsRelayed => "signals_relayed_total",
            Counter::ChatMessages => "chat_messages_total",
            Counter::DeliveriesDropped => "deliveries_dropped_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::ConnectionsTotal => "Total WebSocket connections",
            Counter::MessagesReceived => "Total frames received from clients",
            Counter::MessagesSent => "Total frames sent to clients",
            Counter::Errors => "Malformed or rejected inbound messages",
            Counter::RoomsCreated => "Total rooms created",
            Counter::Joins => "Total room joins",
            Counter::Leaves => "Total room leaves",
            Counter::SignalsRelayed => "Offer/answer/ICE messages relayed to a peer",
            Counter::ChatMessages => "Chat messages broadcast",
            Counter::DeliveriesDropped => "Outbound messages dropped (full or closed channel, unknown target)",
        }
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.inner.counters[counter as usize].fetch_add(n, Relaxed);
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `participants_active` come from the RoomManager.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            render_metric(&mut out, "counter", counter.name(), counter.help(), self.get(counter));
        }

        render_metric(
            &mut out,
            "gauge",
            "connections_active",
            "Currently open WebSocket connections",
            self.inner.connections_active.load(Relaxed),
        );
        render_metric(&mut out, "gauge", "rooms_active", "Rooms currently alive", rooms_active as u64);
        render_metric(
            &mut out,
            "gauge",
            "participants_active",
            "Participants currently in a room",
            participants_active as u64,
        );

        self.inner.message_handling.render(
            "meetsignal_message_handling_seconds",
            "Inbound message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, even if the handler panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP meetsignal_{name} {help}");
    let _ = writeln!(out, "# TYPE meetsignal_{name} {kind}");
    let _ = writeln!(out, "meetsignal_{name} {value}");
}
