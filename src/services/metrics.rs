use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters shared by the monitor, dispatcher and schedulers
#[derive(Debug, Default)]
pub struct Metrics {
    /// Completed monitor cycles
    pub cycles: AtomicU64,
    /// Ticks dropped because a cycle was still running
    pub cycles_skipped: AtomicU64,
    /// Cycles that ended in an error
    pub cycle_errors: AtomicU64,
    pub quotes_fetched: AtomicU64,
    /// Market chunks given up on after retries
    pub fetch_failures: AtomicU64,
    pub snapshots_changed: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub history_flushes: AtomicU64,
    pub reminders_sent: AtomicU64,
    pub expiry_passes: AtomicU64,
    last_cycle_at: AtomicI64,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn record_cycle(&self, at: DateTime<Utc>) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_at.store(at.timestamp(), Ordering::Relaxed);
    }

    pub fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        match self.last_cycle_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Utc.timestamp_opt(ts, 0).single(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 11] = [
            ("spikewatch_cycles_total", "Completed monitor cycles", &self.cycles),
            ("spikewatch_cycles_skipped_total", "Ticks dropped while a cycle was running", &self.cycles_skipped),
            ("spikewatch_cycle_errors_total", "Monitor cycles that failed", &self.cycle_errors),
            ("spikewatch_quotes_fetched_total", "Market quotes received", &self.quotes_fetched),
            ("spikewatch_fetch_failures_total", "Market chunks skipped after retries", &self.fetch_failures),
            ("spikewatch_snapshots_changed_total", "Snapshots that differed from history", &self.snapshots_changed),
            ("spikewatch_notifications_sent_total", "Messages delivered", &self.notifications_sent),
            ("spikewatch_notifications_failed_total", "Messages that failed to deliver", &self.notifications_failed),
            ("spikewatch_history_flushes_total", "History flushes to the store", &self.history_flushes),
            ("spikewatch_reminders_sent_total", "Still-monitoring reminders sent", &self.reminders_sent),
            ("spikewatch_expiry_passes_total", "Tier expiry scheduler passes", &self.expiry_passes),
        ];

        let mut out = String::new();
        for (name, help, counter) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP spikewatch_last_cycle_timestamp Unix time of the last completed cycle\n\
             # TYPE spikewatch_last_cycle_timestamp gauge\n\
             spikewatch_last_cycle_timestamp {}\n",
            self.last_cycle_at.load(Ordering::Relaxed)
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_export() {
        let metrics = Metrics::new();
        assert!(metrics.last_cycle_at().is_none());

        Metrics::inc(&metrics.notifications_sent);
        Metrics::add(&metrics.quotes_fetched, 30);
        metrics.record_cycle(Utc::now());

        assert_eq!(Metrics::get(&metrics.cycles), 1);
        assert!(metrics.last_cycle_at().is_some());

        let text = metrics.prometheus();
        assert!(text.contains("spikewatch_notifications_sent_total 1"));
        assert!(text.contains("spikewatch_quotes_fetched_total 30"));
        assert!(text.contains("# TYPE spikewatch_cycles_total counter"));
    }
}
