//! # Throughput statistics
//!
//! The I/O loop is the only writer of the four counters; the reporter task
//! only reads them. The counters are relaxed atomics, so the reporter may see
//! a packet counted before its bytes or vice versa. The numbers are only
//! statistics; the transient skew is tolerated and no lock is involved.
//!
//! The reporter snapshots the counters on a fixed interval, diffs against the
//! previous snapshot and prints cumulative totals plus per-period rates for
//! both directions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Monotonically increasing traffic counters, shared between the I/O loop
/// (writer) and the reporter (reader).
#[derive(Default)]
pub struct Stats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn add_rx_bytes(&self, len: u64) {
        self.rx_bytes.fetch_add(len, Ordering::Relaxed);
    }

    pub fn add_rx_packets(&self, n: u64) {
        self.rx_packets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, len: u64) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsRecord {
        StatsRecord {
            timestamp: Instant::now(),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// One point-in-time copy of the counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsRecord {
    pub timestamp: Instant,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

impl StatsRecord {
    /// Seconds since `prev`, substituting 1s for a zero period so rate
    /// division is always defined.
    pub fn period_secs(&self, prev: &StatsRecord) -> f64 {
        let period = self
            .timestamp
            .saturating_duration_since(prev.timestamp)
            .as_secs_f64();
        if period > 0.0 { period } else { 1.0 }
    }
}

fn direction_line(
    label: &str,
    packets: u64,
    bytes: u64,
    prev_packets: u64,
    prev_bytes: u64,
    period: f64,
) -> String {
    let pps = packets.saturating_sub(prev_packets) as f64 / period;
    let delta_bytes = bytes.saturating_sub(prev_bytes);
    let mbps = delta_bytes as f64 * 8.0 / period / 1_000_000.0;
    format!(
        "{label:<12} {packets:>11} pkts ({pps:>10.0} pps) {kbytes:>11} KB ({mbps:>6.0} Mbit/s) period:{period:.6}",
        kbytes = bytes / 1000,
    )
}

/// Renders the two-direction report for the interval `prev..cur`.
pub fn render(cur: &StatsRecord, prev: &StatsRecord) -> String {
    let period = cur.period_secs(prev);
    let rx = direction_line(
        "AF_XDP RX:",
        cur.rx_packets,
        cur.rx_bytes,
        prev.rx_packets,
        prev.rx_bytes,
        period,
    );
    let tx = direction_line(
        "       TX:",
        cur.tx_packets,
        cur.tx_bytes,
        prev.tx_packets,
        prev.tx_bytes,
        period,
    );
    format!("{rx}\n{tx}\n")
}

/// Periodic reporter. Sleeps for `interval`, snapshots, prints, repeats until
/// the token is cancelled.
pub async fn report_loop(stats: Arc<Stats>, interval: Duration, token: CancellationToken) {
    let mut prev = stats.snapshot();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let cur = stats.snapshot();
        println!("{}", render(&cur, &prev));
        prev = cur;
    }
}
