//! Admin HTTP server for health checks, metrics and stored values

use crate::metrics;
use crate::storage::{MetricStore, StoreError};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_shared::MetricKind;
use tokio_util::sync::CancellationToken;

/// Serve /healthz, /readyz, /metrics and /value/{kind}/{id} until `shutdown`
/// fires.
pub async fn serve_admin(
    addr: SocketAddr,
    store: Arc<dyn MetricStore>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let store = store.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let store = store.clone();
                async move { Ok::<_, Infallible>(handle(req, store.as_ref()).await) }
            }))
        }
    });

    tracing::info!("Admin HTTP server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn handle(req: Request<Body>, store: &dyn MetricStore) -> Response<Body> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }

    match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "ok\n"),

        "/readyz" => match store.ping().await {
            Ok(()) => text(StatusCode::OK, "ready\n"),
            Err(e) => {
                tracing::warn!("Readiness check failed ({}): {}", store.backend(), e);
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
            }
        },

        "/metrics" => {
            let mut response = Response::new(Body::from(metrics::encode_metrics()));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }

        path => match path.strip_prefix("/value/") {
            Some(rest) => value(rest, store).await,
            None => text(StatusCode::NOT_FOUND, "not found\n"),
        },
    }
}

/// Current value of one metric as plain text.
async fn value(rest: &str, store: &dyn MetricStore) -> Response<Body> {
    let Some((kind, id)) = rest.split_once('/') else {
        return text(StatusCode::NOT_FOUND, "not found\n");
    };
    let Ok(kind) = kind.parse::<MetricKind>() else {
        return text(StatusCode::BAD_REQUEST, "unknown metric type\n");
    };

    match store.get_metric(kind, id).await {
        Ok(metric) => Response::new(Body::from(metric.value_string())),
        Err(StoreError::NotFound { .. } | StoreError::WrongType { .. }) => {
            text(StatusCode::NOT_FOUND, "metric not found\n")
        }
        Err(e) => {
            tracing::warn!("Value lookup for {} {:?} failed: {}", kind, id, e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "storage error\n")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
