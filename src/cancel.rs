//! `CancelRequest` framing plus a thin handle that carries a connection's
//! `BackendKeyData` over to a second, unrelated transport.
//!
//! Cancellation is out-of-band: the backend only recognizes a
//! `CancelRequest` on a freshly opened connection, never on the one being
//! cancelled, so opening that second transport and deciding when to send it
//! is left to collaborators. This is the framing wrapped in the smallest
//! handle that can carry the backend's `{pid, secret}` across that gap.

use std::io::{Read, Write};

use crate::error::Result;
use crate::message::BackendKeyData;
use crate::protocol::ProtocolStream;

/// Carries a connection's `BackendKeyData` so a cancel can be sent on a
/// second, unrelated transport. Built from [`crate::connection::Connection::backend_key`];
/// holds no transport itself until [`Self::cancel`] is called.
#[derive(Debug, Clone, Copy)]
pub struct CancelHandle {
  pid: i32,
  secret: i32,
}

impl CancelHandle {
  pub fn new(key: BackendKeyData) -> Self {
    Self {
      pid: key.pid,
      secret: key.secret,
    }
  }

  /// Sends a `CancelRequest` on `transport`, which must be a freshly
  /// opened connection to the same backend, not the connection being
  /// cancelled. The transport is flushed and then dropped; the backend
  /// closes it after processing the request.
  pub fn cancel<T>(&self, transport: T) -> Result<()>
  where
    T: Read + Write,
  {
    let mut stream = ProtocolStream::new(transport);
    stream.send_cancel_request(self.pid, self.secret)?;
    stream.flush()
  }
}
