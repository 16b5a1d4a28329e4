//! Wire-level vocabulary shared by [`crate::protocol`] and the rest of the
//! crate: message tags, the field descriptor carried by `RowDescription`,
//! and the error/notice field maps.

use std::collections::BTreeMap;
use std::fmt;

/// One-octet message kind identifiers. The startup message, `SSLRequest`
/// and `CancelRequest` are untagged and have no entry here.
pub mod tag {
  pub const AUTHENTICATION: u8 = b'R';
  pub const BACKEND_KEY_DATA: u8 = b'K';
  pub const PARAMETER_STATUS: u8 = b'S';
  pub const READY_FOR_QUERY: u8 = b'Z';
  pub const ROW_DESCRIPTION: u8 = b'T';
  pub const DATA_ROW: u8 = b'D';
  pub const COMMAND_COMPLETE: u8 = b'C';
  pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
  pub const ERROR_RESPONSE: u8 = b'E';
  pub const NOTICE_RESPONSE: u8 = b'N';
  pub const NOTIFICATION_RESPONSE: u8 = b'A';
  pub const PARSE_COMPLETE: u8 = b'1';
  pub const BIND_COMPLETE: u8 = b'2';
  pub const CLOSE_COMPLETE: u8 = b'3';
  pub const NO_DATA: u8 = b'n';
  pub const PORTAL_SUSPENDED: u8 = b's';
  pub const COPY_IN_RESPONSE: u8 = b'G';
  pub const COPY_OUT_RESPONSE: u8 = b'H';
  pub const COPY_BOTH_RESPONSE: u8 = b'W';
  pub const COPY_DATA: u8 = b'd';
  pub const COPY_DONE: u8 = b'c';
  pub const COPY_FAIL: u8 = b'f';

  pub const QUERY: u8 = b'Q';
  pub const PARSE: u8 = b'P';
  pub const BIND: u8 = b'B';
  pub const DESCRIBE: u8 = b'D';
  pub const EXECUTE: u8 = b'E';
  pub const CLOSE: u8 = b'C';
  pub const FLUSH: u8 = b'H';
  pub const SYNC: u8 = b'S';
  pub const TERMINATE: u8 = b'X';
  pub const PASSWORD_MESSAGE: u8 = b'p';
}

pub const PROTOCOL_VERSION: i32 = 196_608;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Column format of a field or a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
  Text,
  Binary,
}

impl Format {
  pub fn from_i16(code: i16) -> Self {
    if code == 0 {
      Format::Text
    } else {
      Format::Binary
    }
  }

  pub fn as_i16(self) -> i16 {
    match self {
      Format::Text => 0,
      Format::Binary => 1,
    }
  }
}

/// A single column descriptor from `RowDescription`.
#[derive(Debug, Clone)]
pub struct FieldDescription {
  pub name: String,
  pub table_oid: u32,
  pub table_attno: i16,
  pub type_oid: u32,
  pub type_len: i16,
  pub type_mod: i32,
  pub format: Format,
}

/// Backend transaction status, carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
  Idle,
  InTransaction,
  InFailedTransaction,
}

impl TransactionStatus {
  pub fn from_byte(b: u8) -> crate::error::Result<Self> {
    match b {
      b'I' => Ok(TransactionStatus::Idle),
      b'T' => Ok(TransactionStatus::InTransaction),
      b'E' => Ok(TransactionStatus::InFailedTransaction),
      other => Err(crate::error::Error::framing(format!(
        "invalid transaction status byte {:?}",
        char::from(other)
      ))),
    }
  }
}

/// `pid`/`secret` pair from `BackendKeyData`, later used to build a
/// `CancelRequest` on a separate connection.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
  pub pid: i32,
  pub secret: i32,
}

/// A `NotificationResponse` (`LISTEN`/`NOTIFY`).
#[derive(Debug, Clone)]
pub struct Notification {
  pub pid: i32,
  pub channel: String,
  pub payload: String,
}

/// One-octet field tags used by both `ErrorResponse` and `NoticeResponse`.
pub mod error_field {
  pub const SEVERITY: u8 = b'S';
  pub const CODE: u8 = b'C';
  pub const MESSAGE: u8 = b'M';
  pub const DETAIL: u8 = b'D';
  pub const HINT: u8 = b'H';
  pub const POSITION: u8 = b'P';
  pub const INTERNAL_POSITION: u8 = b'p';
  pub const INTERNAL_QUERY: u8 = b'q';
  pub const WHERE: u8 = b'W';
  pub const SCHEMA: u8 = b's';
  pub const TABLE: u8 = b't';
  pub const COLUMN: u8 = b'c';
  pub const DATA_TYPE: u8 = b'd';
  pub const CONSTRAINT: u8 = b'n';
  pub const FILE: u8 = b'F';
  pub const LINE: u8 = b'L';
  pub const ROUTINE: u8 = b'R';
}

/// A field map keyed by [`error_field`] tags, shared by `ErrorResponse` and
/// `NoticeResponse` (they parse identically).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap(pub BTreeMap<u8, String>);

impl FieldMap {
  pub fn get(&self, field: u8) -> Option<&str> {
    self.0.get(&field).map(String::as_str)
  }

  pub fn severity(&self) -> Option<&str> {
    self.get(error_field::SEVERITY)
  }

  pub fn code(&self) -> Option<&str> {
    self.get(error_field::CODE)
  }

  pub fn message(&self) -> Option<&str> {
    self.get(error_field::MESSAGE)
  }
}

/// A server-reported `ErrorResponse`, preserved with all fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgError {
  pub fields: FieldMap,
}

impl std::error::Error for PgError {}

impl fmt::Display for PgError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Server error {}: {}",
      self.fields.code().unwrap_or("?????"),
      self.fields.message().unwrap_or("")
    )
  }
}

/// A server-reported `NoticeResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNotice {
  pub fields: FieldMap,
}

impl fmt::Display for PgNotice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Server notice {}: {}",
      self.fields.code().unwrap_or("?????"),
      self.fields.message().unwrap_or("")
    )
  }
}
