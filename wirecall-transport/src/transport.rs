//! The call-level transport contract.
//!
//! A transport moves one encoded call to a server and brings its reply or
//! reply stream back. It never interprets payloads beyond the framing it
//! needs; the value-or-error union inside a reply is the caller's business.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wirecall_core::{
    AuthError, CallError, CallKind, Credential, DemandSink, Encoding, StreamFrame, Subscription,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("http: {0}")]
    Http(String),
    /// The server refused the call before dispatching it.
    #[error("refused: {0}")]
    Refused(AuthError),
    #[error("no such method")]
    NotFound,
}

impl TransportError {
    /// Lift into the caller-facing error, preserving the method name for
    /// the not-found case.
    pub fn into_call_error(self, method: &str) -> CallError {
        match self {
            TransportError::Refused(auth) => CallError::Auth(auth),
            TransportError::NotFound => CallError::NoSuchMethod(method.to_string()),
            TransportError::ConnectionClosed => CallError::ClosedWithoutReply,
            other => CallError::Transport(other.to_string()),
        }
    }
}

/// One fully addressed, fully encoded outbound call.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    /// Full method name, `<service>/<wireName>`.
    pub method: String,
    pub kind: CallKind,
    pub encoding: Encoding,
    pub credential: Credential,
    pub payload: Bytes,
}

/// Consumer's end of one open stream call: frames in reply order, plus the
/// control handle that relays demand back to the producer.
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<Result<StreamFrame, TransportError>>,
    control: Arc<dyn DemandSink>,
}

impl StreamHandle {
    pub fn new(
        events: mpsc::UnboundedReceiver<Result<StreamFrame, TransportError>>,
        control: Arc<dyn DemandSink>,
    ) -> Self {
        StreamHandle { events, control }
    }

    pub fn subscription(&self) -> Subscription {
        Subscription::new(Arc::clone(&self.control))
    }

    /// Next stream event; `None` once the transport side is gone. A `None`
    /// without a preceding terminal frame means the connection died.
    pub async fn next_event(&mut self) -> Option<Result<StreamFrame, TransportError>> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamHandle")
    }
}

/// A connected peer that can carry calls.
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Run one unary call to completion; the returned bytes are the encoded
    /// reply union.
    async fn unary(&self, call: OutboundCall) -> Result<Bytes, TransportError>;

    /// Open one stream call. Frames only flow once the handle's
    /// subscription signals demand.
    async fn open_stream(&self, call: OutboundCall) -> Result<StreamHandle, TransportError>;
}
