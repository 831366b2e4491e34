use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "regard_scores_total",
        "Ticker scores produced, labeled by scoring mode."
    );
    describe_counter!(
        "regard_ai_failures_total",
        "Narrative assessment failures, labeled by kind (error/timeout)."
    );
    describe_counter!(
        "regard_uploads_total",
        "Trade-history uploads processed, labeled by outcome."
    );
    describe_histogram!(
        "regard_upload_duration_ms",
        "Wall-clock duration of an upload analysis run."
    );
    describe_counter!(
        "regard_api_requests_total",
        "Provider API requests, labeled by endpoint and status."
    );
    describe_histogram!(
        "regard_api_latency_ms",
        "Provider API request latency in milliseconds."
    );
    describe_histogram!(
        "regard_db_query_latency_ms",
        "SQLite operation latency in milliseconds, labeled by op."
    );
    describe_counter!(
        "regard_db_query_errors_total",
        "SQLite operation failures, labeled by op."
    );
    describe_counter!(
        "regard_wal_checkpoint_total",
        "WAL checkpoint runs, labeled by status."
    );
    describe_gauge!(
        "regard_wal_checkpoint_pages",
        "Pages checkpointed by the last WAL checkpoint."
    );
    describe_counter!(
        "regard_progress_purged_total",
        "Stale upload progress entries removed."
    );
    describe_counter!(
        "regard_forward_returns_backfilled_total",
        "History rows whose forward returns were backfilled."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        describe();

        metrics::with_local_recorder(&recorder, || {
            let c = metrics::counter!("regard_uploads_total", "status" => "ok");
            c.increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("regard_uploads_total"));
    }
}
