//! Process-wide counters for AT exchanges and fleet events.
//! Snapshotted into the log by the telemetry loop and at shutdown.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static EXCHANGES: AtomicU64 = AtomicU64::new(0);
static EXCHANGE_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static EXCHANGE_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static OPEN_FAILURES: AtomicU64 = AtomicU64::new(0);
static PORT_EVICTIONS: AtomicU64 = AtomicU64::new(0);
static IDENTITY_MISMATCHES: AtomicU64 = AtomicU64::new(0);
static LOOP_ITERATION_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Record one finished request/response exchange.
pub fn observe_exchange(elapsed: Duration, answered: bool) {
    EXCHANGES.fetch_add(1, Ordering::Relaxed);
    if answered {
        let ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
        EXCHANGE_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    } else {
        EXCHANGE_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn inc_open_failures() {
    OPEN_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_port_evictions() {
    PORT_EVICTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_identity_mismatches() {
    IDENTITY_MISMATCHES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_loop_iteration_failures() {
    LOOP_ITERATION_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub exchanges: u64,
    pub exchange_timeouts: u64,
    /// Mean latency of answered exchanges.
    pub exchange_latency_avg_ms: Option<u64>,
    pub open_failures: u64,
    pub port_evictions: u64,
    pub identity_mismatches: u64,
    pub loop_iteration_failures: u64,
}

pub fn snapshot() -> Snapshot {
    let exchanges = EXCHANGES.load(Ordering::Relaxed);
    let timeouts = EXCHANGE_TIMEOUTS.load(Ordering::Relaxed);
    let answered = exchanges.saturating_sub(timeouts);
    let sum = EXCHANGE_LATENCY_SUM_MS.load(Ordering::Relaxed);
    Snapshot {
        exchanges,
        exchange_timeouts: timeouts,
        exchange_latency_avg_ms: if answered > 0 { Some(sum / answered) } else { None },
        open_failures: OPEN_FAILURES.load(Ordering::Relaxed),
        port_evictions: PORT_EVICTIONS.load(Ordering::Relaxed),
        identity_mismatches: IDENTITY_MISMATCHES.load(Ordering::Relaxed),
        loop_iteration_failures: LOOP_ITERATION_FAILURES.load(Ordering::Relaxed),
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "exchanges={} timeouts={} avg_ms={} open_failures={} evictions={} identity_mismatches={} loop_failures={}",
            self.exchanges,
            self.exchange_timeouts,
            self.exchange_latency_avg_ms
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".into()),
            self.open_failures,
            self.port_evictions,
            self.identity_mismatches,
            self.loop_iteration_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests bump them concurrently, so only
    // monotonic deltas are asserted here.
    #[test]
    fn exchange_counters_move_forward() {
        let before = snapshot();
        observe_exchange(Duration::from_millis(40), true);
        observe_exchange(Duration::from_secs(2), false);
        let after = snapshot();
        assert!(after.exchanges >= before.exchanges + 2);
        assert!(after.exchange_timeouts > before.exchange_timeouts);
        assert!(after.exchange_latency_avg_ms.is_some());
    }
}
