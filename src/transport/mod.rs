//! Backend transport.
//!
//! The backend is a socket.io server. Named events travel as socket.io
//! packets over a websocket that reconnects with exponential backoff.

pub mod backoff;
pub mod command;
pub mod envelope;
pub mod session;
pub mod socketio;

pub use backoff::{Backoff, BackoffConfig};
pub use command::{Command, EventSink, NullSink, RecordingSink};
pub use envelope::{ConnectionState, Envelope, InboundEvent, ModelStatusKind, TransportError};
pub use session::{ConnectionConfig, TransportSession};
