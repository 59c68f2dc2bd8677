//! Framed channel transport: one TCP connection, many concurrent calls.
//!
//! The client mints a fresh id per call and demultiplexes replies by id;
//! stream demand travels upstream as `Credit` frames and cancellation as
//! `Cancel`. The server dispatches each call on its own task, so a slow
//! stream never blocks unary traffic on the same connection.

use crate::frame::{Frame, FrameCodec, Refusal};
use crate::transport::{CallTransport, OutboundCall, StreamHandle, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use wirecall_core::{
    AuthError, Credential, Demand, DemandSink, DispatchOutcome, Dispatcher, InboundCall,
    StreamFrame,
};

enum Pending {
    Unary(oneshot::Sender<Result<Bytes, TransportError>>),
    Stream(mpsc::UnboundedSender<Result<StreamFrame, TransportError>>),
}

/// Client side of a channel connection.
pub struct ChannelTransport {
    next_id: AtomicU64,
    writer: mpsc::UnboundedSender<Frame>,
    pending: Arc<DashMap<u64, Pending>>,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ChannelTransport {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Adopt an already connected socket.
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let mut framed_read = FramedRead::new(read_half, FrameCodec::new());
        let mut framed_write = FramedWrite::new(write_half, FrameCodec::new());

        let (writer, mut writer_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(err) = framed_write.send(frame).await {
                    tracing::debug!("channel write failed: {err}");
                    break;
                }
            }
        });

        let pending: Arc<DashMap<u64, Pending>> = Arc::new(DashMap::new());
        let demux = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                match framed_read.next().await {
                    Some(Ok(frame)) => demux_frame(&demux, frame),
                    Some(Err(err)) => {
                        tracing::warn!("channel read failed: {err}");
                        break;
                    }
                    None => break,
                }
            }
            // Every call still in flight loses its connection.
            let ids: Vec<u64> = demux.iter().map(|entry| *entry.key()).collect();
            for id in ids {
                if let Some((_, call)) = demux.remove(&id) {
                    match call {
                        Pending::Unary(tx) => {
                            let _ = tx.send(Err(TransportError::ConnectionClosed));
                        }
                        Pending::Stream(tx) => {
                            let _ = tx.send(Err(TransportError::ConnectionClosed));
                        }
                    }
                }
            }
        });

        ChannelTransport {
            next_id: AtomicU64::new(1),
            writer,
            pending,
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.writer
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

fn demux_frame(pending: &DashMap<u64, Pending>, frame: Frame) {
    let id = frame.id();
    match frame {
        Frame::Reply { payload, .. } => match pending.remove(&id) {
            Some((_, Pending::Unary(tx))) => {
                let _ = tx.send(Ok(payload));
            }
            other => drop_misdirected(id, other, "reply"),
        },
        Frame::Item { payload, .. } => match pending.get(&id) {
            Some(entry) => {
                if let Pending::Stream(tx) = entry.value() {
                    let _ = tx.send(Ok(StreamFrame::Item(payload)));
                } else {
                    tracing::warn!(id, "item frame for a unary call ignored");
                }
            }
            None => tracing::debug!(id, "item frame for unknown call ignored"),
        },
        Frame::StreamError { payload, .. } => match pending.remove(&id) {
            Some((_, Pending::Stream(tx))) => {
                let _ = tx.send(Ok(StreamFrame::Error(payload)));
            }
            other => drop_misdirected(id, other, "stream error"),
        },
        Frame::Complete { .. } => match pending.remove(&id) {
            Some((_, Pending::Stream(tx))) => {
                let _ = tx.send(Ok(StreamFrame::Complete));
            }
            other => drop_misdirected(id, other, "complete"),
        },
        Frame::Refused { refusal, .. } => match pending.remove(&id) {
            Some((_, Pending::Unary(tx))) => {
                let _ = tx.send(Err(refusal.into()));
            }
            Some((_, Pending::Stream(tx))) => {
                let _ = tx.send(Err(refusal.into()));
            }
            None => tracing::debug!(id, "refusal for unknown call ignored"),
        },
        Frame::Call { .. } | Frame::Credit { .. } | Frame::Cancel { .. } => {
            tracing::warn!(id, "server sent a client-only frame, ignored");
        }
    }
}

fn drop_misdirected(id: u64, removed: Option<(u64, Pending)>, what: &str) {
    match removed {
        // Wrong call kind: the call can never finish coherently, fail it.
        Some((_, Pending::Unary(tx))) => {
            let _ = tx.send(Err(TransportError::Protocol(format!(
                "{what} frame for a unary call"
            ))));
        }
        Some((_, Pending::Stream(tx))) => {
            let _ = tx.send(Err(TransportError::Protocol(format!(
                "{what} frame for a stream call"
            ))));
        }
        None => tracing::debug!(id, "{what} frame for unknown call ignored"),
    }
}

/// Relays a local subscriber's demand upstream as channel frames.
struct ChannelDemand {
    id: u64,
    writer: mpsc::UnboundedSender<Frame>,
}

impl DemandSink for ChannelDemand {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self.writer.send(Frame::Credit { id: self.id, n });
    }

    fn cancel(&self) {
        let _ = self.writer.send(Frame::Cancel { id: self.id });
    }
}

#[async_trait]
impl CallTransport for ChannelTransport {
    async fn unary(&self, call: OutboundCall) -> Result<Bytes, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending::Unary(tx));

        let frame = Frame::Call {
            id,
            method: call.method,
            kind: call.kind,
            encoding: call.encoding,
            credential: call.credential.token().map(str::to_string),
            payload: call.payload,
        };
        if let Err(err) = self.send_frame(frame) {
            self.pending.remove(&id);
            return Err(err);
        }
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    async fn open_stream(&self, call: OutboundCall) -> Result<StreamHandle, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(id, Pending::Stream(tx));

        let frame = Frame::Call {
            id,
            method: call.method,
            kind: call.kind,
            encoding: call.encoding,
            credential: call.credential.token().map(str::to_string),
            payload: call.payload,
        };
        if let Err(err) = self.send_frame(frame) {
            self.pending.remove(&id);
            return Err(err);
        }
        let control = Arc::new(ChannelDemand {
            id,
            writer: self.writer.clone(),
        });
        Ok(StreamHandle::new(rx, control))
    }
}

/// Accept loop: one connection task per peer, until the listener fails.
pub async fn serve_channel(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "channel connection accepted");
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(serve_connection(stream, dispatcher));
            }
            Err(err) => {
                tracing::error!("channel accept failed: {err}");
                return;
            }
        }
    }
}

/// Serve one established channel connection to completion.
pub async fn serve_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    let (read_half, write_half) = stream.into_split();
    let mut framed_read = FramedRead::new(read_half, FrameCodec::new());
    let mut framed_write = FramedWrite::new(write_half, FrameCodec::new());

    let (out, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(err) = framed_write.send(frame).await {
                tracing::debug!("channel write failed: {err}");
                break;
            }
        }
    });

    // Demand handles for the streams this connection has open.
    let streams: Arc<DashMap<u64, Arc<Demand>>> = Arc::new(DashMap::new());

    while let Some(next) = framed_read.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("channel read failed: {err}");
                break;
            }
        };
        match frame {
            Frame::Call {
                id,
                method,
                kind: _,
                encoding,
                credential,
                payload,
            } => {
                let call = InboundCall {
                    method,
                    credential: credential
                        .map(Credential::bearer)
                        .unwrap_or_else(Credential::none),
                    payload,
                    encoding,
                };
                let dispatcher = Arc::clone(&dispatcher);
                let out = out.clone();
                let streams = Arc::clone(&streams);
                tokio::spawn(async move {
                    match dispatcher.dispatch(call).await {
                        DispatchOutcome::Unary(reply) => {
                            let _ = out.send(Frame::Reply {
                                id,
                                payload: reply.payload,
                            });
                        }
                        DispatchOutcome::Stream(mut reply) => {
                            streams.insert(id, reply.demand());
                            while let Some(frame) = reply.next_frame().await {
                                let (frame, terminal) = match frame {
                                    StreamFrame::Item(payload) => {
                                        (Frame::Item { id, payload }, false)
                                    }
                                    StreamFrame::Error(payload) => {
                                        (Frame::StreamError { id, payload }, true)
                                    }
                                    StreamFrame::Complete => (Frame::Complete { id }, true),
                                };
                                if out.send(frame).is_err() || terminal {
                                    break;
                                }
                            }
                            streams.remove(&id);
                        }
                        DispatchOutcome::Refused(AuthError::Unauthenticated) => {
                            let _ = out.send(Frame::Refused {
                                id,
                                refusal: Refusal::Unauthenticated,
                            });
                        }
                        DispatchOutcome::Refused(AuthError::Forbidden(detail)) => {
                            let _ = out.send(Frame::Refused {
                                id,
                                refusal: Refusal::Forbidden { detail },
                            });
                        }
                        DispatchOutcome::NotFound => {
                            let _ = out.send(Frame::Refused {
                                id,
                                refusal: Refusal::NotFound,
                            });
                        }
                    }
                });
            }
            Frame::Credit { id, n } => match streams.get(&id) {
                Some(demand) => demand.add(n),
                None => tracing::debug!(id, "credit for unknown stream ignored"),
            },
            Frame::Cancel { id } => {
                if let Some((_, demand)) = streams.remove(&id) {
                    demand.cancel();
                } else {
                    tracing::debug!(id, "cancel for unknown stream ignored");
                }
            }
            other => {
                tracing::warn!(id = other.id(), "client sent a server-only frame, ignored");
            }
        }
    }

    // Connection gone: release every producer still waiting on demand.
    for entry in streams.iter() {
        entry.value().cancel();
    }
    drop(out);
    let _ = writer.await;
}
