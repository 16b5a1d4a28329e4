//! Black-box scenario tests driving the public API end to end over an
//! in-memory loopback transport, per spec §8's canned-byte-stream
//! scenarios. Kept in the teacher's `tests/pg_test.rs` location and
//! one-scenario-per-test shape; unlike the teacher's version this needs no
//! running Postgres since the core has no network dependency of its own.

use bytes::{BufMut, BytesMut};
use pgproto::codec::{oid, TextDecoder};
use pgproto::message::{error_field, tag, Format, TransactionStatus};
use pgproto::{CodecRegistry, Connection, Error, StartupOptions};
use std::any::Any;
use std::io::{self, Cursor, Read, Write};

/// `with_defaults` only covers the text/varchar/bpchar/unknown/name OIDs;
/// scenarios that return an int4 column (as a real `SELECT 1` would) need
/// to register their own decoder for it, same as any caller would.
fn registry_with_int4() -> CodecRegistry {
  let mut registry = CodecRegistry::with_defaults();
  registry.register(Format::Text, oid::INT4, TextDecoder);
  registry
}

/// Splits the read and write directions of a loopback connection the way a
/// real socket's send/receive buffers are split; a bare `Cursor<Vec<u8>>`
/// would let `Connection::connect`'s own `StartupMessage` write clobber the
/// canned backend bytes it is about to read back.
struct Loopback {
  read: Cursor<Vec<u8>>,
  written: Vec<u8>,
}

impl Loopback {
  fn new(canned_backend_bytes: Vec<u8>) -> Self {
    Self {
      read: Cursor::new(canned_backend_bytes),
      written: Vec::new(),
    }
  }
}

impl Read for Loopback {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.read.read(buf)
  }
}

impl Write for Loopback {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.written.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn auth_ok() -> BytesMut {
  let mut wire = BytesMut::new();
  wire.put_u8(tag::AUTHENTICATION);
  wire.put_i32(8);
  wire.put_i32(0);
  wire
}

fn auth_cleartext() -> BytesMut {
  let mut wire = BytesMut::new();
  wire.put_u8(tag::AUTHENTICATION);
  wire.put_i32(8);
  wire.put_i32(3);
  wire
}

fn auth_md5(salt: [u8; 4]) -> BytesMut {
  let mut wire = BytesMut::new();
  wire.put_u8(tag::AUTHENTICATION);
  wire.put_i32(12);
  wire.put_i32(5);
  wire.put_slice(&salt);
  wire
}

fn ready_for_query(status: u8) -> BytesMut {
  let mut wire = BytesMut::new();
  wire.put_u8(tag::READY_FOR_QUERY);
  wire.put_i32(5);
  wire.put_u8(status);
  wire
}

fn row_description(columns: &[(&str, u32)]) -> BytesMut {
  let mut body = BytesMut::new();
  body.put_i16(columns.len() as i16);
  for (name, oid) in columns {
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_i32(0);
    body.put_i16(0);
    body.put_i32(*oid as i32);
    body.put_i16(-1);
    body.put_i32(-1);
    body.put_i16(0);
  }
  let mut wire = BytesMut::new();
  wire.put_u8(tag::ROW_DESCRIPTION);
  wire.put_i32(body.len() as i32 + 4);
  wire.put_slice(&body);
  wire
}

fn data_row(values: &[Option<&[u8]>]) -> BytesMut {
  let mut body = BytesMut::new();
  body.put_i16(values.len() as i16);
  for v in values {
    match v {
      Some(bytes) => {
        body.put_i32(bytes.len() as i32);
        body.put_slice(bytes);
      }
      None => body.put_i32(-1),
    }
  }
  let mut wire = BytesMut::new();
  wire.put_u8(tag::DATA_ROW);
  wire.put_i32(body.len() as i32 + 4);
  wire.put_slice(&body);
  wire
}

fn command_complete(tag_text: &str) -> BytesMut {
  let mut body = BytesMut::new();
  body.put_slice(tag_text.as_bytes());
  body.put_u8(0);
  let mut wire = BytesMut::new();
  wire.put_u8(tag::COMMAND_COMPLETE);
  wire.put_i32(body.len() as i32 + 4);
  wire.put_slice(&body);
  wire
}

fn error_response(severity: &str, code: &str, message: &str) -> BytesMut {
  let mut body = BytesMut::new();
  body.put_u8(error_field::SEVERITY);
  body.put_slice(severity.as_bytes());
  body.put_u8(0);
  body.put_u8(error_field::CODE);
  body.put_slice(code.as_bytes());
  body.put_u8(0);
  body.put_u8(error_field::MESSAGE);
  body.put_slice(message.as_bytes());
  body.put_u8(0);
  body.put_u8(0);
  let mut wire = BytesMut::new();
  wire.put_u8(tag::ERROR_RESPONSE);
  wire.put_i32(body.len() as i32 + 4);
  wire.put_slice(&body);
  wire
}

#[test]
fn test_connect_user_postgres() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  let mut conn = Connection::new(Loopback::new(wire.to_vec()), CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("postgres"), pgproto::auth::PasswordAuthenticator)
    .unwrap();
  assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[test]
fn test_connect_user_cleartext() {
  let mut wire = auth_cleartext();
  wire.unsplit(auth_ok());
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  let options = StartupOptions::new("alice").password("s3cret");
  conn.connect(&options, pgproto::auth::PasswordAuthenticator).unwrap();
}

#[test]
fn test_connect_user_md5() {
  let mut wire = auth_md5([1, 2, 3, 4]);
  wire.unsplit(auth_ok());
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  let options = StartupOptions::new("alice").password("s3cret");
  conn.connect(&options, pgproto::auth::PasswordAuthenticator).unwrap();
}

#[test]
fn test_connect_user_md5_invalid_password_is_server_error() {
  let mut wire = auth_md5([1, 2, 3, 4]);
  wire.unsplit(error_response("FATAL", "28P01", "password authentication failed"));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  let options = StartupOptions::new("alice").password("wrong");
  let err = conn.connect(&options, pgproto::auth::PasswordAuthenticator).unwrap_err();
  match err {
    Error::Server(server_err) => {
      assert_eq!(server_err.fields.code(), Some("28P01"));
    }
    other => panic!("expected a server error, got {other:?}"),
  }
}

#[test]
fn test_query_select_zero_rows() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  wire.unsplit(row_description(&[("?column?", 23)]));
  wire.unsplit(command_complete("SELECT 0"));
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let mut cursor = conn.simple_query("SELECT 1 WHERE false").unwrap();
  assert_eq!(cursor.fields().len(), 1);
  assert_eq!(cursor.fields()[0].name, "?column?");
  assert!(!cursor.next());
  cursor.close().unwrap();
}

#[test]
fn test_query_select_one_row_text() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  wire.unsplit(row_description(&[("greeting", 705)]));
  wire.unsplit(data_row(&[Some(b"hello world")]));
  wire.unsplit(command_complete("SELECT 1"));
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let mut cursor = conn.simple_query("SELECT 'hello world' AS greeting").unwrap();
  assert!(cursor.next());
  let values = cursor.get().unwrap();
  assert_eq!(values.len(), 1);
  let value = values[0].as_ref().unwrap().downcast_ref::<String>().unwrap();
  assert_eq!(value, "hello world");
  assert!(!cursor.next());
  cursor.close().unwrap();
}

#[test]
fn test_query_multi_statement_result_chain() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  wire.unsplit(row_description(&[("a", 23)]));
  wire.unsplit(data_row(&[Some(b"1")]));
  wire.unsplit(command_complete("SELECT 1"));
  wire.unsplit(row_description(&[("b", 23)]));
  wire.unsplit(data_row(&[Some(b"2")]));
  wire.unsplit(command_complete("SELECT 1"));
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, registry_with_int4());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let mut cursor = conn.simple_query("SELECT 1; SELECT 2").unwrap();
  assert!(cursor.next());
  let first = cursor.get().unwrap();
  assert_eq!(
    first[0].as_ref().unwrap().downcast_ref::<String>().unwrap(),
    "1"
  );
  assert!(!cursor.next());
  assert!(cursor.next_result());
  assert!(cursor.next());
  let second = cursor.get().unwrap();
  assert_eq!(
    second[0].as_ref().unwrap().downcast_ref::<String>().unwrap(),
    "2"
  );
  assert!(!cursor.next());
  assert!(!cursor.next_result());
  cursor.close().unwrap();
}

#[test]
fn test_query_server_error_marks_transaction_failed() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  wire.unsplit(row_description(&[("a", 23)]));
  wire.unsplit(data_row(&[Some(b"1")]));
  wire.unsplit(error_response("ERROR", "XX000", "boom"));
  wire.unsplit(ready_for_query(b'E'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, registry_with_int4());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let mut cursor = conn.simple_query("SELECT 1; SELECT pg_sleep(100)").unwrap();
  assert!(cursor.next());
  let _ = cursor.get().unwrap();
  assert!(!cursor.next());
  assert!(cursor.err().is_some());
  cursor.close().unwrap();
  assert_eq!(conn.transaction_status(), TransactionStatus::InFailedTransaction);
}

#[test]
fn test_query_in_progress_blocks_second_query() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  wire.unsplit(row_description(&[("a", 23)]));
  wire.unsplit(data_row(&[Some(b"1")]));
  wire.unsplit(command_complete("SELECT 1"));
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let _cursor = conn.simple_query("SELECT 1").unwrap();
  let err = conn.simple_query("SELECT 2").unwrap_err();
  assert!(matches!(err, Error::QueryInProgress));
}

#[test]
fn test_connect_surfaces_async_notice_and_notification() {
  let mut wire = auth_ok();

  let mut notice = BytesMut::new();
  notice.put_u8(error_field::SEVERITY);
  notice.put_slice(b"NOTICE\0");
  notice.put_u8(0);
  wire.put_u8(tag::NOTICE_RESPONSE);
  wire.put_i32(notice.len() as i32 + 4);
  wire.put_slice(&notice);

  let mut notif = BytesMut::new();
  notif.put_i32(77);
  notif.put_slice(b"chan\0hi\0");
  wire.put_u8(tag::NOTIFICATION_RESPONSE);
  wire.put_i32(notif.len() as i32 + 4);
  wire.put_slice(&notif);

  let mut ps = BytesMut::new();
  ps.put_slice(b"TimeZone\0UTC\0");
  wire.put_u8(tag::PARAMETER_STATUS);
  wire.put_i32(ps.len() as i32 + 4);
  wire.put_slice(&ps);

  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  assert_eq!(conn.parameter("TimeZone").as_deref(), Some("UTC"));
  assert!(conn.has_notification());
  let n = conn.next_notification().unwrap();
  assert_eq!(n.channel, "chan");
  assert_eq!(n.payload, "hi");
  assert!(conn.has_notice());
  assert!(conn.next_notice().is_some());
}

#[test]
fn test_cancel_request_framing() {
  let mut wire = auth_ok();
  let mut backend_key = BytesMut::new();
  backend_key.put_u8(tag::BACKEND_KEY_DATA);
  backend_key.put_i32(12);
  backend_key.put_i32(4242);
  backend_key.put_i32(99);
  wire.unsplit(backend_key);
  wire.unsplit(ready_for_query(b'I'));

  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let key = conn.backend_key().unwrap();
  let handle = pgproto::CancelHandle::new(key);
  let cancel_transport = Cursor::new(Vec::new());
  handle.cancel(cancel_transport).unwrap();
}

#[test]
fn test_scan_into_typed_destination() {
  let mut wire = auth_ok();
  wire.unsplit(ready_for_query(b'I'));
  wire.unsplit(row_description(&[("name", 25), ("note", 25)]));
  wire.unsplit(data_row(&[Some(b"bob"), None]));
  wire.unsplit(command_complete("SELECT 1"));
  wire.unsplit(ready_for_query(b'I'));
  let transport = Loopback::new(wire.to_vec());
  let mut conn = Connection::new(transport, CodecRegistry::with_defaults());
  conn.connect(&StartupOptions::new("alice"), pgproto::auth::PasswordAuthenticator)
    .unwrap();

  let mut cursor = conn.simple_query("SELECT name, note FROM users").unwrap();
  assert!(cursor.next());
  let mut name = String::new();
  let mut note = String::new();
  let nulls = cursor
    .scan(&mut [
      Some(&mut name as &mut dyn Any),
      Some(&mut note as &mut dyn Any),
    ])
    .unwrap();
  assert_eq!(name, "bob");
  assert_eq!(nulls, vec![false, true]);
  cursor.close().unwrap();
}
