//! The generic call helper stubs are written against.
//!
//! A stub is a plain struct holding a [`Client`]; each of its methods is
//! one line addressing a contract method by plain name and argument tuple.
//! The client resolves the wire identity from the contract declaration, so
//! stubs never spell out wire names, overload ranks or request records.

use crate::errors::ErrorMap;
use std::sync::Arc;
use wirecall_core::{
    decode_reply, encode_args, ArgTuple, CallError, CallKind, ContractError, Credential, Encoding,
    MethodDescriptor, ProtocolDescriptor, ServiceContract, StreamFrame, Subscriber, WireType,
};
use wirecall_transport::{CallTransport, OutboundCall};

type CredentialSupplier = Arc<dyn Fn() -> Credential + Send + Sync>;

/// A connected, configured caller. Cheap to clone; clones share the
/// transport and the error registry.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn CallTransport>,
    encoding: Encoding,
    credentials: CredentialSupplier,
    errors: Arc<ErrorMap>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl Client {
    pub fn new(transport: Arc<dyn CallTransport>) -> Self {
        Client {
            transport,
            encoding: Encoding::default(),
            credentials: Arc::new(Credential::none),
            errors: Arc::new(ErrorMap::new()),
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Supply a credential per call; re-reading a rotating token is the
    /// supplier's business.
    pub fn with_credentials<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Credential + Send + Sync + 'static,
    {
        self.credentials = Arc::new(supplier);
        self
    }

    pub fn with_errors(mut self, errors: ErrorMap) -> Self {
        self.errors = Arc::new(errors);
        self
    }

    fn outbound(
        &self,
        method: &'static MethodDescriptor,
        payload: bytes::Bytes,
    ) -> OutboundCall {
        OutboundCall {
            method: method.full_name.clone(),
            kind: method.kind,
            encoding: self.encoding,
            credential: (self.credentials)(),
            payload,
        }
    }

    fn resolve<C: ServiceContract, Args: ArgTuple>(
        &self,
        name: &str,
        kind: CallKind,
    ) -> Result<&'static MethodDescriptor, CallError> {
        let md = ProtocolDescriptor::of::<C>()?.resolve(name, &Args::type_names())?;
        if md.kind != kind {
            return Err(CallError::Contract(ContractError::KindMismatch {
                method: md.full_name.clone(),
                declared: md.kind,
                bound: kind,
            }));
        }
        Ok(md)
    }

    /// Run one unary call: encode, send, decode, rehydrate.
    pub async fn unary<C, Args, T>(&self, name: &str, args: Args) -> Result<T, CallError>
    where
        C: ServiceContract,
        Args: ArgTuple,
        T: WireType,
    {
        let md = self.resolve::<C, Args>(name, CallKind::Unary)?;
        let payload = encode_args(&args, self.encoding)?;
        let reply = self
            .transport
            .unary(self.outbound(md, payload))
            .await
            .map_err(|err| err.into_call_error(&md.full_name))?;
        match decode_reply::<T>(&reply, self.encoding)? {
            Ok(value) => Ok(value),
            Err(record) => Err(self.errors.rehydrate(record)),
        }
    }

    /// Run one stream call to its terminal signal.
    ///
    /// The subscriber gets `on_subscribe` once the stream is open and must
    /// request demand through the subscription for items to flow. Failures
    /// after the stream opened are delivered through `on_error`, not the
    /// return value; the returned future resolves when the stream ends
    /// either way.
    pub async fn stream<C, Args, T, S>(
        &self,
        name: &str,
        args: Args,
        mut subscriber: S,
    ) -> Result<(), CallError>
    where
        C: ServiceContract,
        Args: ArgTuple,
        T: WireType,
        S: Subscriber<T>,
    {
        let md = self.resolve::<C, Args>(name, CallKind::Stream)?;
        let payload = encode_args(&args, self.encoding)?;
        let mut handle = self
            .transport
            .open_stream(self.outbound(md, payload))
            .await
            .map_err(|err| err.into_call_error(&md.full_name))?;

        let subscription = handle.subscription();
        subscriber.on_subscribe(subscription.clone());

        loop {
            match handle.next_event().await {
                Some(Ok(StreamFrame::Item(bytes))) => {
                    match decode_reply::<T>(&bytes, self.encoding) {
                        Ok(Ok(item)) => subscriber.on_next(item),
                        Ok(Err(record)) => {
                            subscriber.on_error(self.errors.rehydrate(record));
                            return Ok(());
                        }
                        Err(err) => {
                            subscription.cancel();
                            subscriber.on_error(CallError::Decode(err));
                            return Ok(());
                        }
                    }
                }
                Some(Ok(StreamFrame::Error(bytes))) => {
                    let error = match decode_reply::<T>(&bytes, self.encoding) {
                        Ok(Err(record)) => self.errors.rehydrate(record),
                        Ok(Ok(_)) => {
                            CallError::Transport("error frame carried a value".to_string())
                        }
                        Err(err) => CallError::Decode(err),
                    };
                    subscriber.on_error(error);
                    return Ok(());
                }
                Some(Ok(StreamFrame::Complete)) => {
                    subscriber.on_complete();
                    return Ok(());
                }
                Some(Err(err)) => {
                    subscriber.on_error(err.into_call_error(&md.full_name));
                    return Ok(());
                }
                None => {
                    // The transport vanished without a terminal signal.
                    subscriber.on_error(CallError::ClosedWithoutReply);
                    return Ok(());
                }
            }
        }
    }
}
