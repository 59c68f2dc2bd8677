//! HTTP client transport.
//!
//! One call is one request: `POST <root>/<service>/<method>` with the
//! encoded argument record as the body and the wire encoding as the content
//! type. Unary replies come back whole; stream replies come back as a
//! chunked body of reply frames (newline-delimited for the readable
//! encoding, length-prefixed for the compact one), pulled lazily so the
//! subscriber's demand is what drains the socket.

use crate::transport::{CallTransport, OutboundCall, StreamHandle, TransportError};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use wirecall_core::{CallKind, Demand, Encoding, StreamFrame};

/// Splits a streamed reply body into whole reply frames.
///
/// Readable bodies are newline-delimited JSON records; compact bodies are
/// 4-byte big-endian length-prefixed payloads.
#[derive(Debug)]
pub struct ReplyFraming {
    encoding: Encoding,
    buf: BytesMut,
}

impl ReplyFraming {
    pub fn new(encoding: Encoding) -> Self {
        ReplyFraming {
            encoding,
            buf: BytesMut::new(),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Whether a partial frame is still buffered.
    pub fn has_residue(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        match self.encoding {
            Encoding::Json => loop {
                let pos = self.buf.iter().position(|&b| b == b'\n')?;
                let line = self.buf.split_to(pos);
                self.buf.advance(1);
                if !line.is_empty() {
                    return Some(line.freeze());
                }
            },
            Encoding::Binary => {
                if self.buf.len() < 4 {
                    return None;
                }
                let mut length_bytes = [0u8; 4];
                length_bytes.copy_from_slice(&self.buf[..4]);
                let frame_len = u32::from_be_bytes(length_bytes) as usize;
                if self.buf.len() < 4 + frame_len {
                    return None;
                }
                self.buf.advance(4);
                Some(self.buf.split_to(frame_len).freeze())
            }
        }
    }
}

/// Whether a reply frame carries the error branch of the union, without
/// fully decoding it.
pub fn is_error_reply(payload: &[u8], encoding: Encoding) -> bool {
    match encoding {
        Encoding::Binary => payload.first() == Some(&1),
        Encoding::Json => serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| v.get("error").cloned())
            .is_some_and(|e| !e.is_null()),
    }
}

/// Client transport speaking the HTTP binding.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

impl HttpTransport {
    /// `base` is the mount root, e.g. `http://localhost:8080/rpc`.
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(client: reqwest::Client, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        HttpTransport { client, base }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }

    async fn send(&self, call: &OutboundCall) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .post(self.url(&call.method))
            .header(reqwest::header::CONTENT_TYPE, call.encoding.content_type())
            .body(call.payload.clone());
        if let Some(token) = call.credential.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;

        match response.status().as_u16() {
            401 => Err(TransportError::Refused(
                wirecall_core::AuthError::Unauthenticated,
            )),
            403 => {
                let detail = response.text().await.unwrap_or_default();
                Err(TransportError::Refused(wirecall_core::AuthError::Forbidden(
                    detail,
                )))
            }
            404 => Err(TransportError::NotFound),
            // 200 carries the value branch, 500 the error branch; both are
            // decodable reply unions.
            200 | 500 => Ok(response),
            other => Err(TransportError::Protocol(format!(
                "unexpected http status {other}"
            ))),
        }
    }
}

#[async_trait]
impl CallTransport for HttpTransport {
    async fn unary(&self, call: OutboundCall) -> Result<Bytes, TransportError> {
        let response = self.send(&call).await?;
        response
            .bytes()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))
    }

    async fn open_stream(&self, call: OutboundCall) -> Result<StreamHandle, TransportError> {
        debug_assert_eq!(call.kind, CallKind::Stream);
        let encoding = call.encoding;
        let response = self.send(&call).await?;

        let demand = Demand::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let puller = Arc::clone(&demand);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut framing = ReplyFraming::new(encoding);
            loop {
                // One item of demand buys one frame; the body is only
                // drained as fast as the subscriber asks.
                if !puller.acquire().await {
                    tracing::debug!("http stream cancelled by subscriber");
                    return;
                }
                let payload = loop {
                    if let Some(payload) = framing.next_frame() {
                        break payload;
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => framing.extend(&chunk),
                        Some(Err(err)) => {
                            let _ = tx.send(Err(TransportError::Http(err.to_string())));
                            return;
                        }
                        None => {
                            if framing.has_residue() {
                                let _ = tx.send(Err(TransportError::Protocol(
                                    "stream body ended inside a frame".to_string(),
                                )));
                            } else {
                                let _ = tx.send(Ok(StreamFrame::Complete));
                            }
                            return;
                        }
                    }
                };
                if is_error_reply(&payload, encoding) {
                    let _ = tx.send(Ok(StreamFrame::Error(payload)));
                    return;
                }
                if tx.send(Ok(StreamFrame::Item(payload))).is_err() {
                    return;
                }
            }
        });

        Ok(StreamHandle::new(rx, demand))
    }
}
