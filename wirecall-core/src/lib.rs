//! Core protocol for wirecall: descriptors derived from plain service
//! contracts, a dual-encoding codec, demand-controlled streaming and the
//! server-side call dispatcher.

pub mod auth;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod proto;
pub mod schema;
pub mod stream;

pub use auth::{AuthVerifier, CallContext, Credential, Principal, Verification, VerifierChain};
pub use codec::{decode_args, decode_reply, encode_args, encode_reply, ArgTuple, Encoding};
pub use dispatch::{
    DispatchOutcome, Dispatcher, DispatcherBuilder, InboundCall, ReplyBytes, ServiceBinder,
};
pub use error::{
    next_correlation_id, AuthError, CallError, CodecError, ContractError, ErrorRecord, Fault,
};
pub use proto::{
    CallKind, ContractBuilder, MethodDescriptor, ProtocolDescriptor, ServiceContract, ServiceName,
};
pub use schema::{short_type_name, Field, Schema, WireType};
pub use stream::{
    stream_pair, Demand, DemandSink, ReplyStream, StreamClosed, StreamFrame, StreamSink,
    Subscriber, Subscription,
};
