//! HTTP binding: one route per mounted method under the rpc root.
//!
//! `POST <root>/<service>/<method>` carries the encoded argument record in
//! the body, encoding chosen by content type. `GET` is a convenience form
//! for readable unary calls only: arguments come from `arg_<i>` query
//! parameters and are converted by the method's request schema. Stream
//! replies are chunked bodies, one reply frame per item; the socket's own
//! flow control is what paces the producer.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use wirecall_core::{
    AuthError, CallKind, Credential, DispatchOutcome, Dispatcher, Encoding, InboundCall,
    ReplyStream, Schema, StreamFrame,
};

/// Routes for every method the dispatcher mounts, nested under `rpc_root`.
pub fn router(dispatcher: Arc<Dispatcher>, rpc_root: &str) -> Router {
    let rpc = Router::new()
        .route("/{service}/{method}", post(handle_post).get(handle_get))
        .with_state(dispatcher);
    Router::new().nest(rpc_root, rpc)
}

fn credential_from(headers: &HeaderMap) -> Credential {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(Credential::bearer)
        .unwrap_or_else(Credential::none)
}

async fn handle_post(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let encoding = Encoding::from_content_type(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );
    let call = InboundCall {
        method: format!("{service}/{method}"),
        credential: credential_from(&headers),
        payload: body,
        encoding,
    };
    let challenge = dispatcher.challenge().to_string();
    respond(dispatcher.dispatch(call).await, encoding, &challenge)
}

async fn handle_get(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let full_method = format!("{service}/{method}");
    let Some(descriptor) = dispatcher.descriptor(&full_method) else {
        return status_response(StatusCode::NOT_FOUND, "no such method");
    };
    if descriptor.kind != CallKind::Unary {
        return status_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "stream methods require POST",
        );
    }
    let record = match query_args(&descriptor.request_schema, &params) {
        Ok(record) => record,
        Err(reason) => return status_response(StatusCode::BAD_REQUEST, &reason),
    };
    let payload = match serde_json::to_vec(&record) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            return status_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let call = InboundCall {
        method: full_method,
        credential: credential_from(&headers),
        payload,
        encoding: Encoding::Json,
    };
    let challenge = dispatcher.challenge().to_string();
    respond(dispatcher.dispatch(call).await, Encoding::Json, &challenge)
}

/// Convert `arg_<i>` query parameters into the method's argument record.
fn query_args(
    schema: &Schema,
    params: &HashMap<String, String>,
) -> Result<JsonValue, String> {
    let Schema::Record { fields, .. } = schema else {
        return Err("method has no argument record".to_string());
    };
    let mut record = JsonMap::new();
    for field in fields {
        // `arg_0=...` or the bare positional form `0=...`.
        let raw = params.get(&field.name).or_else(|| {
            field
                .name
                .strip_prefix("arg_")
                .and_then(|index| params.get(index))
        });
        let value = query_value(&field.schema, raw)
            .map_err(|reason| format!("{}: {reason}", field.name))?;
        record.insert(field.name.clone(), value);
    }
    Ok(JsonValue::Object(record))
}

fn query_value(schema: &Schema, raw: Option<&String>) -> Result<JsonValue, String> {
    match (schema, raw) {
        (Schema::Optional(_), None) => Ok(JsonValue::Null),
        (Schema::Optional(inner), Some(_)) => query_value(inner, raw),
        (_, None) => Err("missing".to_string()),
        (Schema::Boolean, Some(v)) => v
            .parse::<bool>()
            .map(JsonValue::Bool)
            .map_err(|_| "not a boolean".to_string()),
        (Schema::Int | Schema::Long, Some(v)) => v
            .parse::<i64>()
            .map(|n| JsonValue::Number(n.into()))
            .map_err(|_| "not an integer".to_string()),
        (Schema::Float | Schema::Double, Some(v)) => v
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(|| "not a finite number".to_string()),
        (Schema::String, Some(v)) => Ok(JsonValue::String(v.clone())),
        (Schema::Enum { symbols, .. }, Some(v)) => {
            if symbols.iter().any(|s| s == v) {
                Ok(JsonValue::String(v.clone()))
            } else {
                Err(format!("not one of {symbols:?}"))
            }
        }
        _ => Err("not representable as a query parameter".to_string()),
    }
}

fn respond(outcome: DispatchOutcome, encoding: Encoding, challenge: &str) -> Response {
    match outcome {
        DispatchOutcome::Unary(reply) => {
            // The error branch rides a 500 but stays a decodable reply.
            let status = if reply.is_error {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            body_response(status, encoding, Body::from(reply.payload))
        }
        DispatchOutcome::Stream(reply) => {
            body_response(StatusCode::OK, encoding, stream_body(reply, encoding))
        }
        DispatchOutcome::Refused(AuthError::Unauthenticated) => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::WWW_AUTHENTICATE, challenge)
            .body(Body::from("authentication required"))
            .unwrap_or_default(),
        DispatchOutcome::Refused(AuthError::Forbidden(detail)) => {
            status_response(StatusCode::FORBIDDEN, &detail)
        }
        DispatchOutcome::NotFound => status_response(StatusCode::NOT_FOUND, "no such method"),
    }
}

fn body_response(status: StatusCode, encoding: Encoding, body: Body) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, encoding.content_type())
        .body(body)
        .unwrap_or_default()
}

fn status_response(status: StatusCode, detail: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(detail.to_string()))
        .unwrap_or_default()
}

enum StreamState {
    Open(ReplyStream),
    Done,
}

/// Chunked body for a stream reply. One item of demand is granted per body
/// poll, so the producer runs exactly as fast as the peer reads.
fn stream_body(reply: ReplyStream, encoding: Encoding) -> Body {
    let frames = futures::stream::unfold(StreamState::Open(reply), move |state| async move {
        match state {
            StreamState::Open(mut reply) => {
                reply.request(1);
                match reply.next_frame().await {
                    Some(StreamFrame::Item(payload)) => Some((
                        Ok::<Bytes, Infallible>(frame_chunk(&payload, encoding)),
                        StreamState::Open(reply),
                    )),
                    // The error record is the last frame of the body.
                    Some(StreamFrame::Error(payload)) => {
                        Some((Ok(frame_chunk(&payload, encoding)), StreamState::Done))
                    }
                    Some(StreamFrame::Complete) | None => None,
                }
            }
            StreamState::Done => None,
        }
    });
    Body::from_stream(frames)
}

fn frame_chunk(payload: &[u8], encoding: Encoding) -> Bytes {
    match encoding {
        Encoding::Json => {
            let mut buf = BytesMut::with_capacity(payload.len() + 1);
            buf.put_slice(payload);
            buf.put_u8(b'\n');
            buf.freeze()
        }
        Encoding::Binary => {
            let mut buf = BytesMut::with_capacity(4 + payload.len());
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
            buf.freeze()
        }
    }
}
