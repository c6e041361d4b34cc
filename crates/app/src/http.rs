use std::io;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge::Fault;
use bridge::protocol::{self, Method, SERVER_NAME};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::ServerContext;
use crate::server::wait_for_shutdown;

pub const DEFAULT_MAX_INFLIGHT: usize = 128;

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub max_inflight: usize,
    pub body_limit: usize,
    /// Should outlast the bridge's own request timeout so clients see the
    /// JSON-RPC timeout error rather than a bare 408.
    pub request_timeout: Duration,
}

async fn healthcheck() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

async fn server_info(State(context): State<ServerContext>) -> Response {
    let methods: Vec<&str> = Method::ALL.iter().map(|method| method.as_str()).collect();
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "JSON-RPC 2.0",
        "transport": "HTTP",
        "methods": methods,
        "accepting": context.bridge().is_accepting(),
    }))
    .into_response()
}

fn parse_error(message: &str) -> Response {
    let body = protocol::Response::fault(None, &Fault::Parse(message.to_owned()));
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// The body is one JSON document, so it may span lines and skips the
/// newline framing the stream transports use. Size is capped by the body
/// limit layer instead.
async fn rpc_handler(State(context): State<ServerContext>, body: Bytes) -> Response {
    let Ok(text) = std::str::from_utf8(&body) else {
        return parse_error("request body is not valid UTF-8");
    };
    if text.trim().is_empty() {
        return parse_error("empty request body");
    }
    match context.dispatcher.dispatch_text(text.trim()).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn not_found(uri: Uri) -> Response {
    let body = protocol::Response::fault(
        None,
        &Fault::InvalidRequest(format!("not found: {}", uri.path())),
    );
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

pub fn router(context: ServerContext, options: &HttpOptions) -> Router {
    Router::new()
        .route("/healthz", get(healthcheck))
        .route(
            "/",
            post(rpc_handler)
                .layer(
                    ServiceBuilder::new()
                        .layer(DefaultBodyLimit::max(options.body_limit))
                        .layer(TimeoutLayer::with_status_code(
                            StatusCode::REQUEST_TIMEOUT,
                            options.request_timeout,
                        )),
                )
                .get(server_info),
        )
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(ConcurrencyLimitLayer::new(options.max_inflight.max(1)))
        .layer(middleware::from_fn(log_request_response))
        .with_state(context)
}

pub async fn serve(
    listener: TcpListener,
    context: ServerContext,
    options: HttpOptions,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "http listening");
    axum::serve(listener, router(context, &options))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await?;
    info!("http listener stopped");
    Ok(())
}
