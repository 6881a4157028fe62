//! Statement and transaction metrics plus tracing spans.
//!
//! Counters and histograms live on the global [`METRICS`] instance (feature
//! `metrics`). Span helpers live in [`tracing_helpers`] (feature `tracing`).

#[cfg(feature = "metrics")]
pub use self::otel::*;

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram},
        KeyValue,
    };
    use opentelemetry_prometheus::PrometheusExporter;
    use std::time::Duration;

    pub static METRICS: Lazy<StoreMetrics> = Lazy::new(StoreMetrics::init);

    pub struct StoreMetrics {
        pub exporter: PrometheusExporter,
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub transactions_total: Counter<u64>,
        pub connection_wait_duration: Histogram<f64>,
    }

    impl StoreMetrics {
        pub fn init() -> Self {
            let exporter = opentelemetry_prometheus::exporter()
                .build()
                .expect("failed to build prometheus exporter");
            let meter = global::meter("rowkeeper");

            let queries_total = meter
                .u64_counter("rowkeeper_queries_total")
                .with_description("Total statements executed")
                .build();

            let query_errors_total = meter
                .u64_counter("rowkeeper_query_errors_total")
                .with_description("Statements that returned an error")
                .build();

            let query_duration = meter
                .f64_histogram("rowkeeper_query_duration_seconds")
                .with_description("Duration of statements")
                .build();

            let transactions_total = meter
                .u64_counter("rowkeeper_transactions_total")
                .with_description("Transactions by outcome")
                .build();

            let connection_wait_duration = meter
                .f64_histogram("rowkeeper_connection_wait_seconds")
                .with_description("Time spent establishing connections")
                .build();

            Self {
                exporter,
                queries_total,
                query_errors_total,
                query_duration,
                transactions_total,
                connection_wait_duration,
            }
        }

        pub fn record_query(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        /// `outcome` is one of `begin`, `commit`, `rollback`.
        pub fn record_transaction(&self, outcome: &'static str) {
            self.transactions_total
                .add(1, &[KeyValue::new("outcome", outcome)]);
        }

        pub fn record_connection_wait(&self, elapsed: Duration) {
            self.connection_wait_duration
                .record(elapsed.as_secs_f64(), &[]);
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, info_span, Span};

    /// Longer statements are cut in span fields.
    const MAX_STATEMENT_LEN: usize = 256;

    fn shorten(sql: &str) -> &str {
        match sql.char_indices().nth(MAX_STATEMENT_LEN) {
            Some((idx, _)) => &sql[..idx],
            None => sql,
        }
    }

    pub fn execute_query_span(sql: &str) -> Span {
        debug_span!("rowkeeper.execute", db.statement = shorten(sql))
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("rowkeeper.connect")
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("rowkeeper.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("rowkeeper.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("rowkeeper.transaction.rollback")
    }

}
