//! Server-side call dispatch.
//!
//! The dispatcher is a startup-time registry: binding a service walks its
//! contract and produces one strongly-typed invocation closure per method
//! (argument decoder, typed handler call, reply encoder), keyed by the
//! method's full wire name. No per-call reflection or name fiddling is left
//! for the hot path.
//!
//! Per inbound call the machine is strictly sequential: authenticate,
//! decode, invoke, respond. Authentication refusals short-circuit before
//! the handler can observe anything; decode failures and handler errors are
//! converted into portable error records and returned as ordinary replies,
//! never as transport faults.

use crate::auth::{AuthVerifier, CallContext, Credential, VerifierChain};
use crate::codec::{decode_args, encode_reply, ArgTuple, Encoding};
use crate::error::{AuthError, ContractError, ErrorRecord};
use crate::proto::{CallKind, MethodDescriptor, ProtocolDescriptor, ServiceContract};
use crate::schema::WireType;
use crate::stream::{stream_pair, ReplyStream, StreamSink};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// One call as a transport hands it over: full method name, the caller's
/// opaque credential, and the encoded argument record.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub method: String,
    pub credential: Credential,
    pub payload: Bytes,
    pub encoding: Encoding,
}

/// An encoded unary reply plus whether it carries the error branch, so
/// transports can map it onto their own status signalling without decoding
/// it again.
#[derive(Debug, Clone)]
pub struct ReplyBytes {
    pub payload: Bytes,
    pub is_error: bool,
}

/// What became of one inbound call.
#[derive(Debug)]
pub enum DispatchOutcome {
    Unary(ReplyBytes),
    Stream(ReplyStream),
    /// Refused before the handler ran; a transport-level signal, not an
    /// error record.
    Refused(AuthError),
    NotFound,
}

type UnaryFn =
    Arc<dyn Fn(CallContext, Bytes, Encoding) -> BoxFuture<'static, ReplyBytes> + Send + Sync>;
type StreamFn = Arc<dyn Fn(CallContext, Bytes, Encoding) -> ReplyStream + Send + Sync>;

enum Handler {
    Unary(UnaryFn),
    Stream(StreamFn),
}

struct Route {
    descriptor: &'static MethodDescriptor,
    require_auth: bool,
    handler: Handler,
}

/// The per-process dispatch table plus the verifier chain that gates it.
pub struct Dispatcher {
    routes: HashMap<String, Route>,
    verifiers: VerifierChain,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.routes.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Descriptor for a full method name, if mounted.
    pub fn descriptor(&self, full_method: &str) -> Option<&'static MethodDescriptor> {
        self.routes.get(full_method).map(|r| r.descriptor)
    }

    /// Every mounted method, for startup logging and introspection.
    pub fn methods(&self) -> impl Iterator<Item = &'static MethodDescriptor> + '_ {
        self.routes.values().map(|r| r.descriptor)
    }

    /// Challenge to advertise to unauthenticated callers.
    pub fn challenge(&self) -> &str {
        self.verifiers.challenge()
    }

    /// Run one call through authenticate -> decode -> invoke -> respond.
    pub async fn dispatch(&self, call: InboundCall) -> DispatchOutcome {
        let Some(route) = self.routes.get(&call.method) else {
            tracing::debug!(method = %call.method, "no such method");
            return DispatchOutcome::NotFound;
        };

        let principal = match self.verifiers.resolve(&call.credential).await {
            Err(reason) => {
                tracing::warn!(method = %call.method, "call refused: {reason}");
                return DispatchOutcome::Refused(AuthError::Forbidden(reason));
            }
            Ok(Some(principal)) => Some(principal),
            Ok(None) if call.credential.is_present() => {
                // A credential was offered and nobody accepted it.
                tracing::warn!(method = %call.method, "credential not accepted by any verifier");
                return DispatchOutcome::Refused(AuthError::Forbidden(
                    "credential not accepted".to_string(),
                ));
            }
            Ok(None) => {
                if route.require_auth {
                    return DispatchOutcome::Refused(AuthError::Unauthenticated);
                }
                None
            }
        };

        let ctx = CallContext { principal };
        match &route.handler {
            Handler::Unary(f) => DispatchOutcome::Unary(f(ctx, call.payload, call.encoding).await),
            Handler::Stream(f) => DispatchOutcome::Stream(f(ctx, call.payload, call.encoding)),
        }
    }
}

/// Builds a [`Dispatcher`]: verifiers in priority order, then one bound
/// service per contract. Contract violations surface at `build()`.
#[derive(Default)]
pub struct DispatcherBuilder {
    routes: HashMap<String, Route>,
    verifiers: Vec<Arc<dyn AuthVerifier>>,
    error: Option<ContractError>,
}

impl DispatcherBuilder {
    pub fn verifier(mut self, verifier: impl AuthVerifier + 'static) -> Self {
        self.verifiers.push(Arc::new(verifier));
        self
    }

    /// Bind `service` as the implementation of contract `C`. The closure
    /// registers one handler per declared method; missing or mismatched
    /// bindings fail the eventual `build()`.
    pub fn service<C, S, F>(mut self, service: Arc<S>, bind: F) -> Self
    where
        C: ServiceContract,
        S: Send + Sync + 'static,
        F: FnOnce(&mut ServiceBinder<S>),
    {
        if self.error.is_some() {
            return self;
        }
        let proto = match ProtocolDescriptor::of::<C>() {
            Ok(proto) => proto,
            Err(err) => {
                self.error = Some(err);
                return self;
            }
        };
        let mut binder = ServiceBinder {
            proto,
            service,
            routes: HashMap::new(),
            require_auth: false,
            error: None,
        };
        bind(&mut binder);
        if let Some(err) = binder.error {
            self.error = Some(err);
            return self;
        }
        for md in proto.methods.values() {
            if !binder.routes.contains_key(&md.full_name) {
                self.error = Some(ContractError::Unbound(md.full_name.clone()));
                return self;
            }
        }
        self.routes.extend(binder.routes);
        self
    }

    pub fn build(self) -> Result<Dispatcher, ContractError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(Dispatcher {
                routes: self.routes,
                verifiers: VerifierChain::new(self.verifiers),
            }),
        }
    }
}

/// Registers the typed handlers for one service binding.
pub struct ServiceBinder<S> {
    proto: &'static ProtocolDescriptor,
    service: Arc<S>,
    routes: HashMap<String, Route>,
    require_auth: bool,
    error: Option<ContractError>,
}

impl<S: Send + Sync + 'static> ServiceBinder<S> {
    /// Methods registered after this call require a resolved principal;
    /// anonymous calls to them are refused as unauthenticated.
    pub fn require_authentication(&mut self) -> &mut Self {
        self.require_auth = true;
        self
    }

    /// Methods registered after this call tolerate anonymous access (the
    /// default).
    pub fn allow_anonymous(&mut self) -> &mut Self {
        self.require_auth = false;
        self
    }

    /// Bind a unary method: the handler's deferred result is awaited and
    /// its value or failure becomes the reply.
    pub fn unary<Args, T, E, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        Args: ArgTuple,
        T: WireType,
        E: crate::error::Fault,
        F: Fn(Arc<S>, CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let Some(md) = self.resolve::<Args>(name, CallKind::Unary) else {
            return self;
        };
        let service = Arc::clone(&self.service);
        let handler = Arc::new(handler);
        let method = md.full_name.clone();
        let f: UnaryFn = Arc::new(move |ctx, payload, encoding| {
            let service = Arc::clone(&service);
            let handler = Arc::clone(&handler);
            let method = method.clone();
            Box::pin(async move {
                let args: Args = match decode_args(&payload, encoding) {
                    Ok(args) => args,
                    Err(err) => {
                        let record = ErrorRecord::decode_failure(&err);
                        tracing::warn!(
                            correlation_id = %record.correlation_id,
                            method = %method,
                            "request decode failed: {err}"
                        );
                        return ReplyBytes {
                            payload: encode_reply::<T>(Err(&record), encoding),
                            is_error: true,
                        };
                    }
                };
                match handler(service, ctx, args).await {
                    Ok(value) => ReplyBytes {
                        payload: encode_reply(Ok(&value), encoding),
                        is_error: false,
                    },
                    Err(err) => {
                        let record = ErrorRecord::from_fault(&err);
                        tracing::error!(
                            correlation_id = %record.correlation_id,
                            method = %method,
                            "call failed: {err}"
                        );
                        ReplyBytes {
                            payload: encode_reply::<T>(Err(&record), encoding),
                            is_error: true,
                        }
                    }
                }
            })
        });
        self.insert(md, Handler::Unary(f));
        self
    }

    /// Bind a stream method: the handler drives the sink, the dispatcher
    /// bridges it to the wire's pull-controlled stream. Items are emitted
    /// in production order and only under demand.
    pub fn stream<Args, T, E, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        Args: ArgTuple,
        T: WireType,
        E: crate::error::Fault,
        F: Fn(Arc<S>, CallContext, Args, StreamSink<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let Some(md) = self.resolve::<Args>(name, CallKind::Stream) else {
            return self;
        };
        let service = Arc::clone(&self.service);
        let handler = Arc::new(handler);
        let method = md.full_name.clone();
        let f: StreamFn = Arc::new(move |ctx, payload, encoding| {
            let (sink, reply) = stream_pair::<T>(encoding);
            let service = Arc::clone(&service);
            let handler = Arc::clone(&handler);
            let method = method.clone();
            tokio::spawn(async move {
                let args: Args = match decode_args(&payload, encoding) {
                    Ok(args) => args,
                    Err(err) => {
                        let record = ErrorRecord::decode_failure(&err);
                        tracing::warn!(
                            correlation_id = %record.correlation_id,
                            method = %method,
                            "request decode failed: {err}"
                        );
                        sink.error(record);
                        return;
                    }
                };
                match handler(service, ctx, args, sink.clone()).await {
                    Ok(()) => {
                        // A handler may complete through the sink itself;
                        // close on its behalf when it did not.
                        if !sink.is_terminated() {
                            sink.complete();
                        }
                    }
                    Err(err) => {
                        if sink.is_cancelled() {
                            // The consumer already left; nothing to report
                            // and nobody to report it to.
                            tracing::debug!(
                                method = %method,
                                "stream handler ended after cancellation: {err}"
                            );
                            return;
                        }
                        let record = ErrorRecord::from_fault(&err);
                        tracing::error!(
                            correlation_id = %record.correlation_id,
                            method = %method,
                            "stream call failed: {err}"
                        );
                        sink.error(record);
                    }
                }
            });
            reply
        });
        self.insert(md, Handler::Stream(f));
        self
    }

    fn resolve<Args: ArgTuple>(
        &mut self,
        name: &str,
        bound_kind: CallKind,
    ) -> Option<&'static MethodDescriptor> {
        if self.error.is_some() {
            return None;
        }
        let md = match self.proto.resolve(name, &Args::type_names()) {
            Ok(md) => md,
            Err(err) => {
                self.error = Some(err);
                return None;
            }
        };
        if md.kind != bound_kind {
            self.error = Some(ContractError::KindMismatch {
                method: md.full_name.clone(),
                declared: md.kind,
                bound: bound_kind,
            });
            return None;
        }
        if self.routes.contains_key(&md.full_name) {
            self.error = Some(ContractError::BoundTwice(md.full_name.clone()));
            return None;
        }
        Some(md)
    }

    fn insert(&mut self, md: &'static MethodDescriptor, handler: Handler) {
        self.routes.insert(
            md.full_name.clone(),
            Route {
                descriptor: md,
                require_auth: self.require_auth,
                handler,
            },
        );
    }
}
