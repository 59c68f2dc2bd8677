//! In-process transport: calls go straight into a dispatcher with no
//! framing or socket. Useful for embedding a service in its own process
//! and for exercising client code without the network.

use crate::transport::{CallTransport, OutboundCall, StreamHandle, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use wirecall_core::{Credential, DispatchOutcome, Dispatcher, InboundCall};

#[derive(Debug, Clone)]
pub struct LocalTransport {
    dispatcher: Arc<Dispatcher>,
}

impl LocalTransport {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        LocalTransport { dispatcher }
    }

    fn inbound(call: OutboundCall) -> InboundCall {
        InboundCall {
            method: call.method,
            credential: call
                .credential
                .token()
                .map(Credential::bearer)
                .unwrap_or_else(Credential::none),
            payload: call.payload,
            encoding: call.encoding,
        }
    }
}

#[async_trait]
impl CallTransport for LocalTransport {
    async fn unary(&self, call: OutboundCall) -> Result<Bytes, TransportError> {
        match self.dispatcher.dispatch(Self::inbound(call)).await {
            DispatchOutcome::Unary(reply) => Ok(reply.payload),
            DispatchOutcome::Refused(auth) => Err(TransportError::Refused(auth)),
            DispatchOutcome::NotFound => Err(TransportError::NotFound),
            DispatchOutcome::Stream(_) => Err(TransportError::Protocol(
                "stream outcome for a unary call".to_string(),
            )),
        }
    }

    async fn open_stream(&self, call: OutboundCall) -> Result<StreamHandle, TransportError> {
        match self.dispatcher.dispatch(Self::inbound(call)).await {
            DispatchOutcome::Stream(mut reply) => {
                let control = reply.demand();
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    while let Some(frame) = reply.next_frame().await {
                        if tx.send(Ok(frame)).is_err() {
                            reply.cancel();
                            return;
                        }
                    }
                });
                Ok(StreamHandle::new(rx, control))
            }
            DispatchOutcome::Refused(auth) => Err(TransportError::Refused(auth)),
            DispatchOutcome::NotFound => Err(TransportError::NotFound),
            DispatchOutcome::Unary(_) => Err(TransportError::Protocol(
                "unary outcome for a stream call".to_string(),
            )),
        }
    }
}
