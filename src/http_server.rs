use crate::error::PipelineError;
use crate::events::EVENT_CATALOG;
use crate::pipeline::{Pipeline, PipelineResponse};
use crate::types::InboundRequest;
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::rejection::{BytesRejection, PathRejection, QueryRejection},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
struct ServerState {
    pipeline: Arc<Pipeline>,
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let state = ServerState { pipeline };

    Router::new()
        .route("/webhook", post(missing_webhook_id))
        .route("/webhook/", post(missing_webhook_id))
        .route("/webhook/events", get(list_events))
        .route("/webhook/{webhook_id}", post(receive_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, pipeline: Arc<Pipeline>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {addr}"))?;
    let local = listener.local_addr().context("listener has no local address")?;
    tracing::info!(addr = %local, "webhook server listening");

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

async fn receive_webhook(
    State(state): State<ServerState>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> PipelineResponse {
    // An undecodable id cannot name a webhook; keep the raw segment so the
    // lookup answers 404 and the request is still audited.
    let webhook_id = match path {
        Ok(Path(id)) => id,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable webhook id");
            uri.path()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        }
    };
    let query = match query {
        Ok(Query(pairs)) => query_map(pairs),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed query string");
            Map::new()
        }
    };

    let mut params = Map::new();
    params.insert("webhookId".into(), Value::String(webhook_id.clone()));

    let mut request = InboundRequest {
        headers: header_map(&headers),
        query,
        params,
        ..Default::default()
    };
    let rejected = read_body(body, &mut request);

    dispatch(state.pipeline, webhook_id, request, rejected).await
}

async fn missing_webhook_id(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> PipelineResponse {
    let mut request = InboundRequest {
        headers: header_map(&headers),
        ..Default::default()
    };
    let rejected = read_body(body, &mut request);
    dispatch(state.pipeline, String::new(), request, rejected).await
}

/// Fill `request.body`, or return the error for a body that could not be
/// read (over the size limit, or the stream failed).
fn read_body(
    body: Result<Bytes, BytesRejection>,
    request: &mut InboundRequest,
) -> Option<PipelineError> {
    match body {
        Ok(bytes) => {
            request.body = parse_body(&bytes);
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "request body rejected");
            Some(PipelineError::BodyRejected {
                status: e.status(),
                detail: e.body_text(),
            })
        }
    }
}

/// Run the pipeline on its own task. hyper drops the handler future when
/// the client goes away; the spawned task still finishes and audits.
async fn dispatch(
    pipeline: Arc<Pipeline>,
    webhook_id: String,
    request: InboundRequest,
    rejected: Option<PipelineError>,
) -> PipelineResponse {
    let task = tokio::spawn(async move {
        match rejected {
            Some(error) => pipeline.reject(&webhook_id, request, error).await,
            None => pipeline.handle(&webhook_id, request).await,
        }
    });
    match task.await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "webhook task failed");
            PipelineResponse::from_error(&PipelineError::Internal(format!(
                "webhook task failed: {e}"
            )))
        }
    }
}

async fn list_events() -> Json<Value> {
    Json(json!({ "events": EVENT_CATALOG }))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Empty body is `{}`; anything that is not JSON is carried as a string.
fn parse_body(body: &Bytes) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into()))
}

/// Lower-cased names, repeated headers joined with ", ", non UTF-8 values dropped.
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Repeated keys become arrays, like a typical query-string parser.
fn query_map(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in pairs {
        match out.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                out.insert(key, Value::String(value));
            }
        }
    }
    out
}
