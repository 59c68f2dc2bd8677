//! Typed client for wirecall services: a generic call helper for
//! hand-written stubs, plus a closed registry that rehydrates wire error
//! records into native error types.

pub mod client;
pub mod errors;

pub use client::Client;
pub use errors::ErrorMap;
