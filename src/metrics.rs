use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};

use crate::gateway::GatewayRegistry;

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static QUEUE_UPDATES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "external_endpoints_controller_queue_updates",
        "Total service keys enqueued for reconciliation",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static QUEUE_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "external_endpoints_controller_queue_dropped",
        "Total service keys dropped after exhausting their retry budget",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static QUEUE_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "external_endpoints_controller_queue_latency_seconds",
            "Time between a key being enqueued and picked up by a worker",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0, 10.0]),
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

pub static QUEUE_LENGTH: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "external_endpoints_controller_queue_length",
        "Service keys currently waiting in the queue",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Metrics are lazily initialized; force them so scrapes see every series
/// from the first request on.
pub fn register_all() {
    LazyLock::force(&QUEUE_UPDATES);
    LazyLock::force(&QUEUE_DROPPED);
    LazyLock::force(&QUEUE_LATENCY);
    LazyLock::force(&QUEUE_LENGTH);
}

#[derive(Clone)]
pub struct AdminState {
    pub ready: Arc<AtomicBool>,
    pub gateways: Arc<GatewayRegistry>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(ready_handler))
        .route("/gateways", get(gateways_handler))
        .with_state(state)
}

pub async fn serve_admin(
    addr: std::net::SocketAddr,
    state: AdminState,
    shutdown: drain::Watch,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Admin server listening");
    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move {
            shutdown.signaled().await;
        })
        .await?;
    Ok(())
}

async fn ready_handler(State(state): State<AdminState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn gateways_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateways.accounts())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> AdminState {
        AdminState {
            ready: Arc::new(AtomicBool::new(ready)),
            gateways: Arc::new(GatewayRegistry::new()),
        }
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let app = admin_router(test_state(false));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reflects_cache_state() {
        let app = admin_router(test_state(false));
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let app = admin_router(test_state(true));
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exposes_stable_names() {
        register_all();
        let app = admin_router(test_state(true));
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        for name in [
            "external_endpoints_controller_queue_updates",
            "external_endpoints_controller_queue_dropped",
            "external_endpoints_controller_queue_latency_seconds",
            "external_endpoints_controller_queue_length",
        ] {
            assert!(body.contains(name), "missing metric {name}");
        }
    }

    #[tokio::test]
    async fn gateways_returns_json() {
        let app = admin_router(test_state(true));
        let resp = app
            .oneshot(Request::builder().uri("/gateways").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");
    }
}
