use appview_core::metrics::encode_metrics;
use tracing::{error, info};
use warp::Filter;

/// Serves `/metrics` for Prometheus scraping on `port`, grounded in
/// `rsky-indexer/src/bin/indexer.rs`'s inline metrics-server spawn block.
pub async fn serve(port: u16) {
    let route = warp::path!("metrics").map(|| match encode_metrics() {
        Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            warp::reply::with_status(
                format!("error: {e}"),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    });

    info!(port, "metrics server starting");
    warp::serve(route).run(([0, 0, 0, 0], port)).await;
}
