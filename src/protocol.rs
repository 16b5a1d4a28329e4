//! Per-message framing: sends typed messages with correct length prefixes,
//! receives the one-byte type tag then the length-prefixed body, and offers
//! a one-message peek window so synchronous receivers can absorb
//! asynchronous traffic transparently (see [`crate::connection`]).

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::message::{
  tag, BackendKeyData, FieldDescription, FieldMap, Format, Notification, PgError, PgNotice,
  TransactionStatus, CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::bytestream::ByteStream;

/// Reader handed to the `DataRow` per-column callback, bounded to exactly
/// the declared length of one field so a callback can never read into the
/// next field.
pub struct FieldReader<'a, 'b, T> {
  body: &'b mut BodyReader<'a, T>,
  remaining: usize,
}

impl<T> Read for FieldReader<'_, '_, T>
where
  T: Read + Write,
{
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    if self.remaining == 0 {
      return Ok(0);
    }
    let want = buf.len().min(self.remaining);
    let n = self.body.read_raw(&mut buf[..want])?;
    self.remaining -= n;
    Ok(n)
  }
}

impl<T> FieldReader<'_, '_, T>
where
  T: Read + Write,
{
  fn drain_remainder(&mut self) -> std::io::Result<()> {
    let mut scratch = [0u8; 1024];
    while self.remaining > 0 {
      let want = self.remaining.min(scratch.len());
      let n = self.body.read_raw(&mut scratch[..want])?;
      if n == 0 {
        return Err(std::io::Error::new(
          std::io::ErrorKind::UnexpectedEof,
          "connection closed mid-field",
        ));
      }
      self.remaining -= n;
    }
    Ok(())
  }
}

/// Tracks bytes consumed while parsing one message body, so every receiver
/// can verify `consumed == declared_length` before returning.
struct BodyReader<'a, T> {
  stream: &'a mut ByteStream<T>,
  consumed: usize,
}

impl<'a, T> BodyReader<'a, T>
where
  T: Read + Write,
{
  fn new(stream: &'a mut ByteStream<T>) -> Self {
    Self { stream, consumed: 0 }
  }

  fn read_u8(&mut self) -> Result<u8> {
    let v = self.stream.read_u8()?;
    self.consumed += 1;
    Ok(v)
  }

  fn read_i16(&mut self) -> Result<i16> {
    let v = self.stream.read_i16()?;
    self.consumed += 2;
    Ok(v)
  }

  fn read_i32(&mut self) -> Result<i32> {
    let v = self.stream.read_i32()?;
    self.consumed += 4;
    Ok(v)
  }

  fn read_cstring(&mut self) -> Result<String> {
    let s = self.stream.read_cstring()?;
    self.consumed += s.len() + 1;
    Ok(s)
  }

  fn read_raw(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = self.stream.read_raw(buf)?;
    self.consumed += n;
    Ok(n)
  }

  fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
    self.stream.read_exact(buf)?;
    self.consumed += buf.len();
    Ok(())
  }

  fn field<'b>(&'b mut self, length: usize) -> FieldReader<'a, 'b, T> {
    FieldReader {
      body: self,
      remaining: length,
    }
  }

  fn finish(self, tag: u8, declared_len: i32) -> Result<()> {
    let expected = (declared_len - 4).max(0) as usize;
    if self.consumed != expected {
      return Err(Error::length_mismatch(tag, expected, self.consumed));
    }
    Ok(())
  }
}

/// A buffered message stream plus a one-slot peek buffer.
///
/// Invariant: whenever a tag has been peeked, the next call to read a tag
/// returns it without consuming another octet; any call that begins
/// reading a message body clears the peek.
pub struct ProtocolStream<T> {
  stream: ByteStream<T>,
  peeked: Option<u8>,
}

/// Result of reading the single untagged octet after an `SSLRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslResponse {
  Accepted,
  Rejected,
}

impl<T> ProtocolStream<T>
where
  T: Read + Write,
{
  pub fn new(inner: T) -> Self {
    Self {
      stream: ByteStream::new(inner),
      peeked: None,
    }
  }

  pub fn into_inner(self) -> T {
    self.stream.into_inner()
  }

  /// Returns the next message tag without consuming any body bytes.
  /// Repeated calls return the same tag until [`next_tag`][Self::next_tag]
  /// or a receive-body call is invoked.
  pub fn peek_tag(&mut self) -> Result<u8> {
    if let Some(t) = self.peeked {
      return Ok(t);
    }
    let t = self.stream.read_u8()?;
    self.peeked = Some(t);
    Ok(t)
  }

  /// Returns and consumes the next message tag.
  pub fn next_tag(&mut self) -> Result<u8> {
    let t = if let Some(t) = self.peeked.take() {
      t
    } else {
      self.stream.read_u8()?
    };
    #[cfg(feature = "log-verbose")]
    log::trace!("recv {:?}", char::from(t));
    Ok(t)
  }

  fn clear_peek(&mut self) {
    self.peeked = None;
  }

  pub fn flush(&mut self) -> Result<()> {
    self.stream.flush()?;
    Ok(())
  }

  // ---- frontend sends -------------------------------------------------

  fn send(&mut self, tag: Option<u8>, body: BytesMut) -> Result<()> {
    #[cfg(feature = "log-verbose")]
    log::trace!(
      "send {:?} ({} body byte(s))",
      tag.map(char::from),
      body.len()
    );
    if let Some(t) = tag {
      self.stream.write_u8(t)?;
    }
    self.stream.write_i32((body.len() + 4) as i32)?;
    self.stream.write_raw(&body)?;
    Ok(())
  }

  pub fn send_startup(&mut self, options: &BTreeMap<String, String>) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    for (k, v) in options {
      body.put_slice(k.as_bytes());
      body.put_u8(0);
      body.put_slice(v.as_bytes());
      body.put_u8(0);
    }
    body.put_u8(0);
    self.send(None, body)
  }

  pub fn send_ssl_request(&mut self) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_i32(SSL_REQUEST_CODE);
    self.send(None, body)
  }

  pub fn send_cancel_request(&mut self, pid: i32, secret: i32) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_i32(CANCEL_REQUEST_CODE);
    body.put_i32(pid);
    body.put_i32(secret);
    self.send(None, body)
  }

  pub fn send_query(&mut self, query: &str) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(query.as_bytes());
    body.put_u8(0);
    self.send(Some(tag::QUERY), body)
  }

  pub fn send_password(&mut self, password: &str) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(password.as_bytes());
    body.put_u8(0);
    self.send(Some(tag::PASSWORD_MESSAGE), body)
  }

  /// Sends a `PasswordMessage`-tagged frame with an explicit body and no
  /// implied NUL terminator, used by the SASL exchange whose
  /// `SASLInitialResponse`/`SASLResponse` payloads are not C strings.
  pub fn send_raw_password_message(&mut self, body: &[u8]) -> Result<()> {
    let mut owned = BytesMut::new();
    owned.put_slice(body);
    self.send(Some(tag::PASSWORD_MESSAGE), owned)
  }

  pub fn send_parse(&mut self, stmt_name: &str, query: &str, param_types: &[u32]) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(stmt_name.as_bytes());
    body.put_u8(0);
    body.put_slice(query.as_bytes());
    body.put_u8(0);
    body.put_i16(param_types.len() as i16);
    for oid in param_types {
      body.put_i32(*oid as i32);
    }
    self.send(Some(tag::PARSE), body)
  }

  pub fn send_bind(
    &mut self,
    portal: &str,
    stmt: &str,
    formats: &[Format],
    params: &[Option<&[u8]>],
    result_formats: &[Format],
  ) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(portal.as_bytes());
    body.put_u8(0);
    body.put_slice(stmt.as_bytes());
    body.put_u8(0);
    body.put_i16(formats.len() as i16);
    for f in formats {
      body.put_i16(f.as_i16());
    }
    body.put_i16(params.len() as i16);
    for p in params {
      match p {
        Some(bytes) => {
          body.put_i32(bytes.len() as i32);
          body.put_slice(bytes);
        }
        None => body.put_i32(-1),
      }
    }
    body.put_i16(result_formats.len() as i16);
    for f in result_formats {
      body.put_i16(f.as_i16());
    }
    self.send(Some(tag::BIND), body)
  }

  pub fn send_describe(&mut self, kind: u8, name: &str) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_u8(kind);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    self.send(Some(tag::DESCRIBE), body)
  }

  pub fn send_execute(&mut self, portal: &str, max_rows: i32) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(portal.as_bytes());
    body.put_u8(0);
    body.put_i32(max_rows);
    self.send(Some(tag::EXECUTE), body)
  }

  pub fn send_close(&mut self, kind: u8, name: &str) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_u8(kind);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    self.send(Some(tag::CLOSE), body)
  }

  pub fn send_copy_data(&mut self, bytes: &[u8]) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(bytes);
    self.send(Some(tag::COPY_DATA), body)
  }

  pub fn send_copy_done(&mut self) -> Result<()> {
    self.send(Some(tag::COPY_DONE), BytesMut::new())
  }

  pub fn send_copy_fail(&mut self, reason: &str) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_slice(reason.as_bytes());
    body.put_u8(0);
    self.send(Some(tag::COPY_FAIL), body)
  }

  pub fn send_flush(&mut self) -> Result<()> {
    self.send(Some(tag::FLUSH), BytesMut::new())
  }

  pub fn send_sync(&mut self) -> Result<()> {
    self.send(Some(tag::SYNC), BytesMut::new())
  }

  pub fn send_terminate(&mut self) -> Result<()> {
    self.send(Some(tag::TERMINATE), BytesMut::new())
  }

  // ---- backend receives -------------------------------------------------
  // Every receive assumes the tag has already been consumed via
  // next_tag()/peek_tag(), mirroring the source's "Next() then dispatch".

  /// `S` after `SSLRequest`: a single untagged octet, not length-prefixed.
  pub fn receive_ssl_response(&mut self) -> Result<SslResponse> {
    match self.stream.read_u8()? {
      b'S' => Ok(SslResponse::Accepted),
      b'N' => Ok(SslResponse::Rejected),
      other => Err(Error::framing(format!(
        "invalid SSLRequest response byte {:?}",
        char::from(other)
      ))),
    }
  }

  pub fn receive_auth_response(&mut self) -> Result<(i32, Vec<u8>)> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let subtype = body.read_i32()?;
    let mut rest = vec![0u8; (declared - 8).max(0) as usize];
    if !rest.is_empty() {
      body.read_exact(&mut rest)?;
    }
    body.finish(tag::AUTHENTICATION, declared)?;
    Ok((subtype, rest))
  }

  pub fn receive_backend_key_data(&mut self) -> Result<BackendKeyData> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let pid = body.read_i32()?;
    let secret = body.read_i32()?;
    body.finish(tag::BACKEND_KEY_DATA, declared)?;
    Ok(BackendKeyData { pid, secret })
  }

  pub fn receive_parameter_status(&mut self) -> Result<(String, String)> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let name = body.read_cstring()?;
    let value = body.read_cstring()?;
    body.finish(tag::PARAMETER_STATUS, declared)?;
    Ok((name, value))
  }

  pub fn receive_ready_for_query(&mut self) -> Result<TransactionStatus> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let status = body.read_u8()?;
    body.finish(tag::READY_FOR_QUERY, declared)?;
    TransactionStatus::from_byte(status)
  }

  pub fn receive_row_description(&mut self) -> Result<Vec<FieldDescription>> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let n = body.read_i16()?;
    let mut fields = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
      let name = body.read_cstring()?;
      let table_oid = body.read_i32()? as u32;
      let table_attno = body.read_i16()?;
      let type_oid = body.read_i32()? as u32;
      let type_len = body.read_i16()?;
      let type_mod = body.read_i32()?;
      let format = Format::from_i16(body.read_i16()?);
      fields.push(FieldDescription {
        name,
        table_oid,
        table_attno,
        type_oid,
        type_len,
        type_mod,
        format,
      });
    }
    body.finish(tag::ROW_DESCRIPTION, declared)?;
    Ok(fields)
  }

  /// Delivers a `DataRow` by invoking `on_field(col_num_1based, reader,
  /// length)` for each column without buffering field bytes. For a NULL
  /// column (`length == -1`) `on_field` is invoked but must not read from
  /// the reader.
  pub fn receive_data_row<F>(&mut self, mut on_field: F) -> Result<()>
  where
    F: FnMut(i16, &mut dyn Read, i32) -> Result<()>,
  {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let n = body.read_i16()?;
    for i in 0..n {
      let length = body.read_i32()?;
      if length < 0 {
        on_field(i + 1, &mut std::io::empty(), length)?;
        continue;
      }
      let mut field = body.field(length as usize);
      let result = on_field(i + 1, &mut field, length);
      field.drain_remainder()?;
      result?;
    }
    body.finish(tag::DATA_ROW, declared)?;
    Ok(())
  }

  pub fn receive_command_complete(&mut self) -> Result<String> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let cmd_tag = body.read_cstring()?;
    body.finish(tag::COMMAND_COMPLETE, declared)?;
    Ok(cmd_tag)
  }

  /// Verifies the fixed `len=4` body of a no-payload message
  /// (`EmptyQueryResponse`, `ParseComplete`, `BindComplete`,
  /// `CloseComplete`, `NoData`, `PortalSuspended`, `CopyDone`, `Flush`,
  /// `Sync`, `Terminate`).
  pub fn receive_empty(&mut self, expected_tag: u8) -> Result<()> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let body = BodyReader::new(&mut self.stream);
    body.finish(expected_tag, declared)
  }

  fn receive_field_map(&mut self, expected_tag: u8) -> Result<FieldMap> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let mut fields = BTreeMap::new();
    loop {
      let code = body.read_u8()?;
      if code == 0 {
        break;
      }
      fields.insert(code, body.read_cstring()?);
    }
    body.finish(expected_tag, declared)?;
    Ok(FieldMap(fields))
  }

  pub fn receive_error_response(&mut self) -> Result<PgError> {
    Ok(PgError {
      fields: self.receive_field_map(tag::ERROR_RESPONSE)?,
    })
  }

  pub fn receive_notice_response(&mut self) -> Result<PgNotice> {
    Ok(PgNotice {
      fields: self.receive_field_map(tag::NOTICE_RESPONSE)?,
    })
  }

  pub fn receive_notification_response(&mut self) -> Result<Notification> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let pid = body.read_i32()?;
    let channel = body.read_cstring()?;
    let payload = body.read_cstring()?;
    body.finish(tag::NOTIFICATION_RESPONSE, declared)?;
    Ok(Notification { pid, channel, payload })
  }

  /// `CopyInResponse` / `CopyOutResponse` / `CopyBothResponse` body:
  /// overall format octet plus one format code per column.
  pub fn receive_copy_response(&mut self, expected_tag: u8) -> Result<(u8, Vec<i16>)> {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let overall_format = body.read_u8()?;
    let n = body.read_i16()?;
    let mut formats = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
      formats.push(body.read_i16()?);
    }
    body.finish(expected_tag, declared)?;
    Ok((overall_format, formats))
  }

  pub fn receive_copy_data<F>(&mut self, mut on_data: F) -> Result<()>
  where
    F: FnMut(&mut dyn Read, i32) -> Result<()>,
  {
    self.clear_peek();
    let declared = self.stream.read_i32()?;
    let mut body = BodyReader::new(&mut self.stream);
    let length = (declared - 4).max(0);
    let mut field = body.field(length as usize);
    let result = on_data(&mut field, length);
    field.drain_remainder()?;
    result?;
    body.finish(tag::COPY_DATA, declared)?;
    Ok(())
  }
}
