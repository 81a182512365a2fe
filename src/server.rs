//! HTTP surface of the proxy using Axum
//!
//! Routes (all `GET`):
//! - `/add`, `/remove`  register / unregister a server (`server` or `port`)
//! - `/set`             change the poll interval (`timeout`, seconds)
//! - `/metrics`, `/`    the aggregated payload
//!
//! Any route takes an optional `callback` and then answers JSONP:
//! `{callback}([{json}]);` as `application/javascript`. Callbacks outside
//! `[A-Za-z0-9_$.]` are ignored and plain JSON is served.

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    extract::{ConnectInfo, Query, State, rejection::QueryRejection},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::registry::{Registry, RequestContext};
use crate::schema::{IntervalResponse, ServerListResponse};

/// Content type of the text exposition format.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Query string of every route; each handler reads what it needs.
#[derive(Debug, Default, Deserialize)]
pub struct Params {
    server: Option<String>,
    port: Option<String>,
    timeout: Option<String>,
    callback: Option<String>,
}

impl Params {
    fn callback(&self) -> Option<&str> {
        let callback = self
            .callback
            .as_deref()
            .map(str::trim)
            .filter(|cb| !cb.is_empty())?;

        if !is_js_identifier_path(callback) {
            log::debug!("Ignoring callback {callback:?}");
            return None;
        }
        Some(callback)
    }
}

/// `name` or `ns.name`, nothing that could run as script.
fn is_js_identifier_path(callback: &str) -> bool {
    callback
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'))
}

/// Extracted query string; a rejection (e.g. a repeated key) is answered
/// with the failure body of the route instead of axum's plain-text 400.
type ParamsResult = Result<Query<Params>, QueryRejection>;

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/add", get(handle_add))
        .route("/remove", get(handle_remove))
        .route("/set", get(handle_set))
        .route("/metrics", get(handle_metrics))
        .route("/", get(handle_metrics))
        .with_state(registry)
}

/// Binds `listen` and serves until `shutdown` resolves.
pub async fn serve(
    listen: SocketAddr,
    registry: Registry,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(registry).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

// ------------------------------------------------------------
// Registration
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Registration {
    Add,
    Remove,
}

async fn handle_add(
    State(registry): State<Registry>,
    params: ParamsResult,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    register(registry, params, headers, peer, Registration::Add).await
}

async fn handle_remove(
    State(registry): State<Registry>,
    params: ParamsResult,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    register(registry, params, headers, peer, Registration::Remove).await
}

async fn register(
    registry: Registry,
    params: ParamsResult,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    op: Registration,
) -> Response {
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            log::warn!("{op:?} request rejected: {}", rejection.body_text());
            let body = ServerListResponse::failed(
                rejection.body_text(),
                registry.list_ids().await,
            );
            return render_json(None, &body);
        }
    };

    let ctx = RequestContext {
        server: params.server.clone(),
        port: params.port.clone(),
        forwarded_for: header_value(&headers, X_FORWARDED_FOR),
        real_ip: header_value(&headers, X_REAL_IP),
        peer: peer.map(|ConnectInfo(addr)| addr.ip()),
    };

    let server = match Registry::resolve_server_identity(&ctx) {
        Ok(server) => server,
        Err(e) => {
            log::warn!("{op:?} request rejected: {e}");
            let body = ServerListResponse::failed(e.to_string(), registry.list_ids().await);
            return render_json(params.callback(), &body);
        }
    };

    let ids = match op {
        Registration::Add => registry.add(server).await,
        Registration::Remove => registry.remove(&server).await,
    };

    render_json(params.callback(), &ServerListResponse::ok(ids))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ------------------------------------------------------------
// Interval
// ------------------------------------------------------------

async fn handle_set(State(registry): State<Registry>, params: ParamsResult) -> Response {
    let current = registry.poll_interval().await.as_secs();

    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            log::warn!("Set request rejected: {}", rejection.body_text());
            let body = IntervalResponse::failed(rejection.body_text(), current);
            return render_json(None, &body);
        }
    };

    let Some(raw) = params.timeout.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        let body = IntervalResponse::failed("Timeout is not provided", current);
        return render_json(params.callback(), &body);
    };

    let body = match raw.parse::<i64>() {
        Err(_) => IntervalResponse::failed(format!("Timeout is not a number: {raw}"), current),
        Ok(secs) => match registry.set_poll_interval(secs).await {
            Ok(interval) => IntervalResponse::ok(interval.as_secs()),
            Err(e) => IntervalResponse::failed(e.to_string(), current),
        },
    };

    render_json(params.callback(), &body)
}

// ------------------------------------------------------------
// Aggregate
// ------------------------------------------------------------

async fn handle_metrics(State(registry): State<Registry>, params: ParamsResult) -> Response {
    // A malformed query string still gets the plain exposition payload
    let params = params.map(|Query(params)| params).unwrap_or_default();
    let data = registry.aggregate().await;
    log::debug!("Sending {} bytes of data", data.len());

    match params.callback() {
        Some(callback) => {
            let text = String::from_utf8_lossy(&data);
            match serde_json::to_string(&text) {
                Ok(json) => jsonp(callback, &json),
                Err(e) => internal_error(e),
            }
        }
        None => ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], data).into_response(),
    }
}

// ------------------------------------------------------------
// Rendering
// ------------------------------------------------------------

fn render_json<T: Serialize>(callback: Option<&str>, body: &T) -> Response {
    let json = match serde_json::to_string(body) {
        Ok(json) => json,
        Err(e) => return internal_error(e),
    };

    match callback {
        Some(callback) => jsonp(callback, &json),
        None => ([(CONTENT_TYPE, "application/json")], json).into_response(),
    }
}

fn jsonp(callback: &str, json: &str) -> Response {
    (
        [(CONTENT_TYPE, "application/javascript")],
        format!("{callback}([{json}]);"),
    )
        .into_response()
}

fn internal_error(e: serde_json::Error) -> Response {
    log::error!("Failed to encode response: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response").into_response()
}
