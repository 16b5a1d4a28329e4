use std::io;

use crate::message::{Format, PgError};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the protocol core.
///
/// `Transport` and `Framing` are fatal to the connection; `ProtocolState` is
/// fatal to the current operation and typically the connection; `Server`
/// carries a backend `ErrorResponse` verbatim; the rest are domain-specific
/// and leave the connection usable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("transport error: {0}")]
  Transport(#[from] io::Error),

  #[error("framing error: {0}")]
  Framing(String),

  #[error("protocol error: {0}")]
  ProtocolState(String),

  #[error("{0}")]
  Server(#[from] PgError),

  #[error("post: COPY statements are not supported")]
  CopyUnsupported,

  #[error("post: got empty query")]
  EmptyQuery,

  #[error("post: no row available for reading")]
  NoRow,

  #[error("post: query in progress")]
  QueryInProgress,

  #[error("post: could not find decoder for type {type_oid} ({format:?})")]
  MissingDecoder { type_oid: u32, format: Format },

  #[error("post: want {expected} fields; got {got}")]
  ScanArityMismatch { expected: usize, got: usize },

  #[error("post: want non-nil scan destination at index {0}")]
  ScanNilDestination(usize),

  #[error("post: unsupported authentication subtype {0}")]
  UnsupportedAuthSubtype(i32),

  #[error("post: decode error: {0}")]
  Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  pub fn framing(msg: impl Into<String>) -> Self {
    Error::Framing(msg.into())
  }

  pub fn protocol_state(msg: impl Into<String>) -> Self {
    Error::ProtocolState(msg.into())
  }

  /// Declared length didn't match bytes actually consumed while parsing a message body.
  pub fn length_mismatch(tag: u8, declared: usize, consumed: usize) -> Self {
    Error::Framing(format!(
      "message {:?}: declared length {} but consumed {} bytes",
      char::from(tag),
      declared,
      consumed
    ))
  }

  pub fn unexpected_tag(expected: &str, got: u8) -> Self {
    Error::ProtocolState(format!("expected {expected}; got {:?}", char::from(got)))
  }
}
