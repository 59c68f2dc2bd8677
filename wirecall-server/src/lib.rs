//! Server bindings for wirecall services: an axum HTTP binding, an
//! optional framed channel listener and process logging setup.

pub mod http;
pub mod logging;
pub mod server;

pub use http::router;
pub use logging::{init_logging, init_test_logging};
pub use server::{Server, ServerConfig};
