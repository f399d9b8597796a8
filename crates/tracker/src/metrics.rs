use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub fn describe() {
    describe_counter!(
        "tracker_error_log_events",
        "Cumulative count of all ERROR-level log events."
    );
    describe_histogram!(
        "tracker_db_query_latency_ms",
        "SQLite operation latency in milliseconds."
    );
    describe_counter!("tracker_db_query_errors_total", "SQLite operation errors.");
    describe_histogram!(
        "tracker_api_latency_ms",
        "Data-provider request latency in milliseconds."
    );
    describe_counter!(
        "tracker_api_requests_total",
        "Data-provider requests, labeled by endpoint and status."
    );
    describe_counter!(
        "tracker_api_errors_total",
        "Data-provider failures classified by kind."
    );
    describe_counter!(
        "tracker_wallets_discovered_total",
        "Wallets inserted from the seed source."
    );
    describe_counter!(
        "tracker_wallets_scored_total",
        "Wallets run through the scoring pipeline."
    );
    describe_gauge!("tracker_smart_wallets", "Currently elected smart wallets.");
    describe_gauge!(
        "tracker_wallets_tracked",
        "Wallets covered by the last live-tracking pass."
    );
    describe_counter!(
        "tracker_position_changes_total",
        "Position changes detected by the live tracker."
    );
    describe_counter!(
        "tracker_histories_replaced_total",
        "Per-token history replacements triggered by position changes."
    );
    describe_counter!(
        "tracker_migrations_detected_total",
        "Wallet migrations detected and recorded."
    );
    describe_counter!(
        "tracker_consensus_signals_total",
        "Consensus signals written or refreshed."
    );
    describe_counter!(
        "tracker_notifications_sent_total",
        "Alerts delivered to the notification sink."
    );
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // Localhost only: scraped by a local agent, never exposed publicly.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Prefix("tracker_".to_string()), HISTOGRAM_BUCKETS_MS)
        .map_err(anyhow::Error::from)?
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;

    Ok(())
}
