//! Transports for wirecall: the call-level transport contract, a framed
//! channel over TCP and an HTTP binding client.

pub mod channel;
pub mod frame;
pub mod http;
pub mod local;
pub mod transport;

pub use channel::{serve_channel, serve_connection, ChannelTransport};
pub use frame::{Frame, FrameCodec, FrameCodecError, Refusal};
pub use http::{is_error_reply, HttpTransport, ReplyFraming};
pub use local::LocalTransport;
pub use transport::{CallTransport, OutboundCall, StreamHandle, TransportError};
