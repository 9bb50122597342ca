//! Publish-session counters, recorded through the `metrics` facade rather
//! than a bespoke snapshot struct — mirrors `src/services/binance/metrics.rs`
//! and `solana_client::metrics::stream`'s `LazyLock<Metrics>` +
//! `describe_counter!`/`counter!` shape. Recording a counter is a cheap,
//! infallible no-op until an embedder installs a recorder (e.g. a
//! `metrics-exporter-prometheus` exporter), so `core` can call these
//! unconditionally without depending on one being present.

use std::sync::LazyLock;

use metrics::{counter, describe_counter};

/// Global access point for Publish Session metrics.
pub static METRICS: LazyLock<Metrics> = LazyLock::new(|| {
    describe_counter!(
        "dialout_session_attempts_total",
        "Dial attempts made by a publish session"
    );
    describe_counter!(
        "dialout_session_messages_sent_total",
        "Notifications sent on a publish session's stream"
    );
    describe_counter!(
        "dialout_session_messages_received_total",
        "Inbound messages observed (and ignored) on a publish session's stream"
    );
    describe_counter!(
        "dialout_session_errors_total",
        "Transient errors encountered by a publish session"
    );
    Metrics
});

pub struct Metrics;

#[allow(clippy::unused_self)]
impl Metrics {
    pub fn inc_attempt(&self, subscription: &str) {
        counter!("dialout_session_attempts_total", "subscription" => subscription.to_owned())
            .increment(1);
    }

    pub fn inc_sent(&self, subscription: &str) {
        counter!("dialout_session_messages_sent_total", "subscription" => subscription.to_owned())
            .increment(1);
    }

    pub fn inc_received(&self, subscription: &str) {
        counter!("dialout_session_messages_received_total", "subscription" => subscription.to_owned())
            .increment(1);
    }

    pub fn inc_error(&self, subscription: &str) {
        counter!("dialout_session_errors_total", "subscription" => subscription.to_owned())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_methods_do_not_panic() {
        METRICS.inc_attempt("HS_RDMA");
        METRICS.inc_sent("HS_RDMA");
        METRICS.inc_received("HS_RDMA");
        METRICS.inc_error("HS_RDMA");
    }
}
