//! Core PostgreSQL frontend/backend wire protocol (3.0): a framing codec,
//! a connection state machine for startup/authentication/simple-query, and
//! a streaming row cursor with pluggable per-column decoding.
//!
//! The three subsystems compose bottom-up: [`bytestream::ByteStream`] does
//! buffered big-endian primitive I/O over any blocking transport;
//! [`protocol::ProtocolStream`] frames typed messages on top of it;
//! [`connection::Connection`] and [`cursor::RowCursor`] drive the state
//! machine and own the stream across a query's lifetime.
//!
//! Connection pooling, the extended-query (Parse/Bind/Describe/Execute/Sync)
//! choreography, COPY choreography, and a higher-level query API are
//! explicitly out of scope — this crate gives collaborators the framing and
//! the synchronous/asynchronous message plumbing to build those on top of.

#[cfg(feature = "ssl")]
pub use openssl;

pub mod auth;
pub mod bytestream;
pub mod cancel;
pub mod codec;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod message;
pub mod protocol;
#[cfg(test)]
mod testutil;

pub use bytestream::ByteStream;
pub use cancel::CancelHandle;
pub use codec::{CodecRegistry, Decoder};
pub use connection::{Connection, NegotiatedTransport, StartupOptions};
pub use cursor::RowCursor;
pub use error::{Error, Result};
pub use message::{
  BackendKeyData, FieldDescription, Format, Notification, PgError, PgNotice, TransactionStatus,
};
pub use protocol::{ProtocolStream, SslResponse};
