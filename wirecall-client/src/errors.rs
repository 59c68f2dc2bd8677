//! Rehydration of wire error records into native error values.
//!
//! The union of errors a client understands is closed and explicit: each
//! origin name is registered with a constructor. Records with no registered
//! origin fall back to the verbatim [`CallError::Remote`] form, so an
//! unknown error is never silently reshaped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use wirecall_core::{CallError, ErrorRecord};

type Rehydrate =
    Box<dyn Fn(&ErrorRecord) -> Box<dyn std::error::Error + Send + Sync> + Send + Sync>;

/// Origin-name-keyed registry of error constructors.
#[derive(Default)]
pub struct ErrorMap {
    constructors: HashMap<String, Rehydrate>,
}

impl ErrorMap {
    pub fn new() -> Self {
        ErrorMap::default()
    }

    /// Register a constructor for records whose origin is `origin`.
    pub fn register<E, F>(mut self, origin: impl Into<String>, constructor: F) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&ErrorRecord) -> E + Send + Sync + 'static,
    {
        self.constructors
            .insert(origin.into(), Box::new(move |record| Box::new(constructor(record))));
        self
    }

    /// Turn a wire record into the richest error the registry can produce.
    /// A panicking constructor is contained and demoted to the fallback.
    pub fn rehydrate(&self, record: ErrorRecord) -> CallError {
        if let Some(constructor) = self.constructors.get(&record.origin_class_name) {
            match catch_unwind(AssertUnwindSafe(|| constructor(&record))) {
                Ok(err) => return CallError::Known(err),
                Err(_) => {
                    tracing::warn!(
                        origin = %record.origin_class_name,
                        correlation_id = %record.correlation_id,
                        "error constructor panicked, falling back to the raw record"
                    );
                }
            }
        }
        CallError::remote(record)
    }
}

impl std::fmt::Debug for ErrorMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorMap")
            .field("origins", &self.constructors.len())
            .finish()
    }
}
