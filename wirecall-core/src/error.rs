use crate::proto::CallKind;
use crate::schema::{short_type_name, Field, Schema};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use thiserror::Error;

/// The portable error record every method shares.
///
/// Fields cross the wire under the camelCase names `correlationId`,
/// `message` and `originClassName`. The correlation id is minted at the
/// point of failure and exists for log cross-referencing only; nothing is
/// allowed to depend on it for correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub correlation_id: String,
    pub message: Option<String>,
    pub origin_class_name: String,
}

impl ErrorRecord {
    pub fn new(message: Option<String>, origin: impl Into<String>) -> Self {
        ErrorRecord {
            correlation_id: next_correlation_id(),
            message,
            origin_class_name: origin.into(),
        }
    }

    /// Capture a handler failure.
    pub fn from_fault<E: Fault>(err: &E) -> Self {
        ErrorRecord::new(Some(err.to_string()), err.origin())
    }

    /// Capture a request that could not be decoded.
    pub fn decode_failure(err: &CodecError) -> Self {
        ErrorRecord::new(Some(err.to_string()), "DecodeError")
    }

    /// The shared three-field error schema.
    pub fn schema() -> Schema {
        Schema::record(
            "ErrorRecord",
            vec![
                Field::new("correlationId", Schema::String),
                Field::new("message", Schema::optional(Schema::String)),
                Field::new("originClassName", Schema::String),
            ],
        )
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.correlation_id,
            self.origin_class_name,
            self.message.as_deref().unwrap_or("<no message>")
        )
    }
}

static CORRELATION_PREFIX: LazyLock<String> =
    LazyLock::new(|| uuid::Uuid::new_v4().to_string());
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique correlation id: one UUID per process, one counter per id.
pub fn next_correlation_id() -> String {
    let n = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", &*CORRELATION_PREFIX, n)
}

/// A handler failure that can be named on the wire.
///
/// Blanket-implemented for every `std::error::Error`; the wire-visible
/// origin defaults to the error's short type name, which is what the client
/// side keys its rehydration registry on.
pub trait Fault: std::fmt::Display + Send + 'static {
    fn origin(&self) -> &'static str;
}

impl<E: std::error::Error + Send + 'static> Fault for E {
    fn origin(&self) -> &'static str {
        short_type_name::<E>()
    }
}

/// Codec failures: malformed or schema-incompatible bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary: {0}")]
    Binary(#[from] postcard::Error),
    #[error("argument record field {0} is missing or mistyped")]
    Argument(String),
    #[error("reply record carries neither value nor error")]
    EmptyReply,
}

/// Service contract violations. Fatal at startup, never per-call.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("service contract for {service} declares no methods")]
    Empty { service: String },
    #[error("duplicate method declaration {service}.{name}({signature})")]
    DuplicateSignature {
        service: String,
        name: String,
        signature: String,
    },
    #[error("no declared method matches {service}.{name}({signature})")]
    UnknownMethod {
        service: String,
        name: String,
        signature: String,
    },
    #[error("{method} is declared as a {declared:?} call but bound as {bound:?}")]
    KindMismatch {
        method: String,
        declared: CallKind,
        bound: CallKind,
    },
    #[error("method {0} bound more than once")]
    BoundTwice(String),
    #[error("method {0} declared but never bound")]
    Unbound(String),
}

/// Authentication refusals. These are transport-level signals; they never
/// travel as error records because no handler-side state was touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential and the method does not tolerate anonymous access.
    #[error("unauthenticated")]
    Unauthenticated,
    /// A credential was presented but no verifier accepted it.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

/// Everything a caller can observe going wrong with a call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The remote handler failed; carries the record verbatim. This is the
    /// always-available fallback when no rehydration mapping is registered
    /// for the origin type.
    #[error("[{correlation_id}] remote {origin}: {message:?}")]
    Remote {
        correlation_id: String,
        message: Option<String>,
        origin: String,
    },
    /// A registered rehydration mapping produced a native error value.
    #[error("{0}")]
    Known(Box<dyn std::error::Error + Send + Sync>),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("decode: {0}")]
    Decode(#[from] CodecError),
    /// The transport closed before any reply arrived; distinguishable from
    /// an application error by construction.
    #[error("connection closed without a reply")]
    ClosedWithoutReply,
    #[error("transport: {0}")]
    Transport(String),
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl CallError {
    /// The verbatim fallback wrapper around a wire error record.
    pub fn remote(record: ErrorRecord) -> Self {
        CallError::Remote {
            correlation_id: record.correlation_id,
            message: record.message,
            origin: record.origin_class_name,
        }
    }
}
