use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

const SECONDS_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Batch sizes, rounds per batch and bisection depths.
const COUNT_BUCKETS: &[f64] = &[
    0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0,
];

/// Serve `router` on `bind` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global Prometheus recorder, expose it on `/metrics` and track
/// every route of `router`. Every metric carries a `service` label naming the
/// binary.
pub fn setup_metrics_routes(router: Router, service: &'static str) -> Result<Router, BuildError> {
    let recorder_handle = prometheus_builder(service)?.install_recorder()?;

    Ok(router
        .route("/metrics", get(move || ready(recorder_handle.render())))
        .layer(axum::middleware::from_fn(track_http_requests)))
}

fn prometheus_builder(service: &'static str) -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .add_global_label("service", service)
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), SECONDS_BUCKETS)?
        .set_buckets_for_metric(Matcher::Suffix("_batch_size".to_string()), COUNT_BUCKETS)?
        .set_buckets_for_metric(Matcher::Suffix("_rounds".to_string()), COUNT_BUCKETS)?
        .set_buckets_for_metric(Matcher::Suffix("_depth".to_string()), COUNT_BUCKETS)
}

/// Count and time the health check and scrape requests hitting a binary.
async fn track_http_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    // Unmatched paths are folded together to keep label cardinality bounded.
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |path| path.as_str().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("playback_http_requests_total", &labels).increment(1);
    metrics::histogram!("playback_http_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_lines<'a>(rendered: &'a str, metric: &str) -> Vec<&'a str> {
        let prefix = format!("{metric}_bucket{{");
        rendered
            .lines()
            .filter(|line| line.starts_with(&prefix))
            .collect()
    }

    #[test]
    fn counts_and_latencies_use_their_own_buckets() {
        let recorder = prometheus_builder("playback-worker")
            .unwrap()
            .build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!("playback_batch_rounds").record(3.0);
            metrics::histogram!("playback_store_put_duration_seconds").record(0.02);
        });
        let rendered = handle.render();

        let rounds = bucket_lines(&rendered, "playback_batch_rounds");
        assert!(rounds.iter().any(|line| line.contains("le=\"1024\"")));
        assert!(!rounds.iter().any(|line| line.contains("le=\"0.005\"")));
        assert!(rounds
            .iter()
            .all(|line| line.contains("service=\"playback-worker\"")));

        let latency = bucket_lines(&rendered, "playback_store_put_duration_seconds");
        assert!(latency.iter().any(|line| line.contains("le=\"0.005\"")));
        assert!(!latency.iter().any(|line| line.contains("le=\"1024\"")));
    }
}
