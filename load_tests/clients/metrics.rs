use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use serde::{Deserialize, Serialize};

/// Metrics collected during a test client session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    pub client_id: String,
    pub room_id: String,
    pub connection_successful: bool,
    pub connection_time_ms: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub chats_sent: u64,
    pub chats_echoed: u64,
    pub offers_sent: u64,
    pub signals_received: u64,
    pub peak_room_size: u64,
    pub errors: Vec<String>,
    pub session_duration_ms: u64,
    pub signaling_latencies: SignalingLatencyReport,
}

/// Signaling latency report per operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingLatencyReport {
    pub operations: HashMap<String, LatencyStats>,
}

/// Latency statistics for a single operation type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<u64>) -> Option<Self> {
        samples.sort_unstable();
        let (&min_ms, &max_ms) = (samples.first()?, samples.last()?);
        let count = samples.len();
        Some(Self {
            count,
            min_ms,
            max_ms,
            avg_ms: samples.iter().sum::<u64>() / count as u64,
            p50_ms: percentile(&samples, 0.50),
            p95_ms: percentile(&samples, 0.95),
            p99_ms: percentile(&samples, 0.99),
        })
    }
}

/// Real-time metrics collector (thread-safe)
pub struct MetricsCollector {
    client_id: String,
    room_id: String,
    start_time: Instant,
    connection_successful: AtomicBool,
    connection_time_ms: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    chats_sent: AtomicU64,
    chats_echoed: AtomicU64,
    offers_sent: AtomicU64,
    signals_received: AtomicU64,
    peak_room_size: AtomicU64,
    errors: std::sync::Mutex<Vec<String>>,
    signaling_latencies: std::sync::Mutex<HashMap<String, Vec<u64>>>,
}

impl MetricsCollector {
    pub fn new(client_id: String, room_id: String) -> Self {
        Self {
            client_id,
            room_id,
            start_time: Instant::now(),
            connection_successful: AtomicBool::new(false),
            connection_time_ms: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            chats_sent: AtomicU64::new(0),
            chats_echoed: AtomicU64::new(0),
            offers_sent: AtomicU64::new(0),
            signals_received: AtomicU64::new(0),
            peak_room_size: AtomicU64::new(0),
            errors: std::sync::Mutex::new(Vec::new()),
            signaling_latencies: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_connection_successful(&self, connect_ms: u64) {
        self.connection_successful.store(true, Ordering::SeqCst);
        self.connection_time_ms.store(connect_ms, Ordering::SeqCst);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chat_sent(&self) {
        self.chats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chat_echoed(&self) {
        self.chats_echoed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offer_sent(&self) {
        self.offers_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_room_size(&self, size: usize) {
        self.peak_room_size.fetch_max(size as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error);
        }
    }

    /// Record a signaling round-trip latency for a named operation
    pub fn record_signaling_latency(&self, operation: &str, ms: u64) {
        if let Ok(mut latencies) = self.signaling_latencies.lock() {
            latencies.entry(operation.to_string()).or_default().push(ms);
        }
    }

    /// Generate final metrics report (sync, safe to call from an OS thread)
    pub fn generate_report(&self) -> ClientMetrics {
        let errors = self.errors.lock().map(|e| e.clone()).unwrap_or_default();
        let latencies = self.signaling_latencies.lock().map(|l| l.clone()).unwrap_or_default();
        let operations = latencies
            .into_iter()
            .filter_map(|(op, samples)| LatencyStats::from_samples(samples).map(|stats| (op, stats)))
            .collect();

        ClientMetrics {
            client_id: self.client_id.clone(),
            room_id: self.room_id.clone(),
            connection_successful: self.connection_successful.load(Ordering::SeqCst),
            connection_time_ms: self.connection_time_ms.load(Ordering::SeqCst),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            chats_sent: self.chats_sent.load(Ordering::Relaxed),
            chats_echoed: self.chats_echoed.load(Ordering::Relaxed),
            offers_sent: self.offers_sent.load(Ordering::Relaxed),
            signals_received: self.signals_received.load(Ordering::Relaxed),
            peak_room_size: self.peak_room_size.load(Ordering::Relaxed),
            errors,
            session_duration_ms: self.start_time.elapsed().as_millis() as u64,
            signaling_latencies: SignalingLatencyReport { operations },
        }
    }
}

/// Per-room summary statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub total_clients: usize,
    pub successful_connections: usize,
    pub peak_room_size: u64,
    pub chats_sent: u64,
    pub chats_echoed: u64,
    pub total_errors: usize,
}

/// Aggregates metrics from multiple clients
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub total_clients: usize,
    pub successful_connections: usize,
    pub failed_connections: usize,
    pub average_connection_time_ms: u64,
    pub p50_connection_time_ms: u64,
    pub p95_connection_time_ms: u64,
    pub p99_connection_time_ms: u64,
    pub total_frames_sent: u64,
    pub total_frames_received: u64,
    pub total_chats_sent: u64,
    pub total_chats_echoed: u64,
    pub total_offers_sent: u64,
    pub total_signals_received: u64,
    pub average_session_duration_ms: u64,
    pub total_errors: usize,
    pub signaling_latencies: SignalingLatencyReport,
    pub rooms: Vec<RoomSummary>,
}

impl TestSummary {
    pub fn from_metrics(metrics: &[ClientMetrics]) -> Self {
        if metrics.is_empty() {
            return Self::default();
        }

        let total_clients = metrics.len();
        let successful_connections = metrics.iter().filter(|m| m.connection_successful).count();

        let mut connection_times: Vec<u64> = metrics
            .iter()
            .filter(|m| m.connection_successful)
            .map(|m| m.connection_time_ms)
            .collect();
        connection_times.sort_unstable();
        let average_connection_time_ms = if connection_times.is_empty() {
            0
        } else {
            connection_times.iter().sum::<u64>() / connection_times.len() as u64
        };

        Self {
            total_clients,
            successful_connections,
            failed_connections: total_clients - successful_connections,
            average_connection_time_ms,
            p50_connection_time_ms: percentile(&connection_times, 0.50),
            p95_connection_time_ms: percentile(&connection_times, 0.95),
            p99_connection_time_ms: percentile(&connection_times, 0.99),
            total_frames_sent: metrics.iter().map(|m| m.frames_sent).sum(),
            total_frames_received: metrics.iter().map(|m| m.frames_received).sum(),
            total_chats_sent: metrics.iter().map(|m| m.chats_sent).sum(),
            total_chats_echoed: metrics.iter().map(|m| m.chats_echoed).sum(),
            total_offers_sent: metrics.iter().map(|m| m.offers_sent).sum(),
            total_signals_received: metrics.iter().map(|m| m.signals_received).sum(),
            average_session_duration_ms: metrics.iter().map(|m| m.session_duration_ms).sum::<u64>()
                / total_clients as u64,
            total_errors: metrics.iter().map(|m| m.errors.len()).sum(),
            signaling_latencies: Self::aggregate_latencies(metrics),
            rooms: Self::compute_room_summaries(metrics),
        }
    }

    fn compute_room_summaries(metrics: &[ClientMetrics]) -> Vec<RoomSummary> {
        let mut room_map: HashMap<String, Vec<&ClientMetrics>> = HashMap::new();
        for m in metrics {
            room_map.entry(m.room_id.clone()).or_default().push(m);
        }

        let mut rooms: Vec<RoomSummary> = room_map
            .into_iter()
            .map(|(room_id, clients)| RoomSummary {
                room_id,
                total_clients: clients.len(),
                successful_connections: clients.iter().filter(|c| c.connection_successful).count(),
                peak_room_size: clients.iter().map(|c| c.peak_room_size).max().unwrap_or(0),
                chats_sent: clients.iter().map(|c| c.chats_sent).sum(),
                chats_echoed: clients.iter().map(|c| c.chats_echoed).sum(),
                total_errors: clients.iter().map(|c| c.errors.len()).sum(),
            })
            .collect();

        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    /// Per-client p50 values pooled across clients; raw samples stay per client.
    fn aggregate_latencies(metrics: &[ClientMetrics]) -> SignalingLatencyReport {
        let mut pooled: HashMap<String, Vec<u64>> = HashMap::new();
        for m in metrics {
            for (op, stats) in &m.signaling_latencies.operations {
                pooled.entry(op.clone()).or_default().push(stats.p50_ms);
            }
        }

        let operations = pooled
            .into_iter()
            .filter_map(|(op, samples)| LatencyStats::from_samples(samples).map(|stats| (op, stats)))
            .collect();
        SignalingLatencyReport { operations }
    }

    pub fn print_summary(&self) {
        println!("\n=== Load Test Summary ===");
        println!("Total Clients: {}", self.total_clients);
        println!("Successful Connections: {}", self.successful_connections);
        println!("Failed Connections: {}", self.failed_connections);
        println!("\nConnection Time:");
        println!("  Average: {} ms", self.average_connection_time_ms);
        println!("  P50: {} ms", self.p50_connection_time_ms);
        println!("  P95: {} ms", self.p95_connection_time_ms);
        println!("  P99: {} ms", self.p99_connection_time_ms);
        println!("\nSignaling Traffic:");
        println!("  Frames Sent: {}", self.total_frames_sent);
        println!("  Frames Received: {}", self.total_frames_received);
        println!("  Offers Sent: {}", self.total_offers_sent);
        println!("  Signals Received: {}", self.total_signals_received);
        let echo_ratio = if self.total_chats_sent > 0 {
            format!("{:.1}%", self.total_chats_echoed as f64 / self.total_chats_sent as f64 * 100.0)
        } else {
            "N/A".to_string()
        };
        println!("  Chats Sent: {} (echoed back: {})", self.total_chats_sent, echo_ratio);

        if !self.signaling_latencies.operations.is_empty() {
            println!("\nSignaling Latencies (aggregated across clients):");
            let mut ops: Vec<_> = self.signaling_latencies.operations.iter().collect();
            ops.sort_by_key(|(k, _)| (*k).clone());
            for (op, stats) in &ops {
                println!("  {}: avg={}ms p50={}ms p95={}ms p99={}ms (n={})",
                    op, stats.avg_ms, stats.p50_ms, stats.p95_ms, stats.p99_ms, stats.count);
            }
        }

        if self.rooms.len() > 1 {
            println!("\nPer-Room Breakdown ({} rooms):", self.rooms.len());
            for room in &self.rooms {
                println!("  {}: {} clients, peak size {}, {} chats, {} errors",
                    room.room_id, room.total_clients, room.peak_room_size, room.chats_sent, room.total_errors);
            }
        }

        println!("\nSession:");
        println!("  Average Duration: {} ms ({:.2} s)", self.average_session_duration_ms, self.average_session_duration_ms as f64 / 1000.0);
        println!("  Total Errors: {}", self.total_errors);
        println!("========================\n");
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}
