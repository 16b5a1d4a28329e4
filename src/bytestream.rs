//! Buffered, big-endian primitive read/write over a blocking bidirectional
//! byte transport (plain TCP, a Unix socket, or a TLS stream wrapping one).

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};

const READ_CHUNK: usize = 8 * 1024;

/// Wraps a transport plus separate read-side and write-side buffers.
///
/// Destroyed along with the transport handle it owns; there is no explicit
/// `close` — dropping it drops the transport.
#[derive(Debug)]
pub struct ByteStream<T> {
  inner: T,
  read_buf: BytesMut,
  write_buf: BytesMut,
}

impl<T> ByteStream<T>
where
  T: Read + Write,
{
  pub fn new(inner: T) -> Self {
    Self {
      inner,
      read_buf: BytesMut::new(),
      write_buf: BytesMut::new(),
    }
  }

  pub fn get_ref(&self) -> &T {
    &self.inner
  }

  pub fn into_inner(self) -> T {
    self.inner
  }

  fn fill_at_least(&mut self, n: usize) -> io::Result<()> {
    while self.read_buf.len() < n {
      let mut chunk = [0u8; READ_CHUNK];
      let read = self.inner.read(&mut chunk)?;
      if read == 0 {
        return Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "connection closed before the expected bytes were received",
        ));
      }
      self.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(())
  }

  pub fn read_u8(&mut self) -> io::Result<u8> {
    self.fill_at_least(1)?;
    Ok(self.read_buf.get_u8())
  }

  pub fn read_i16(&mut self) -> io::Result<i16> {
    self.fill_at_least(2)?;
    Ok(self.read_buf.get_i16())
  }

  pub fn read_i32(&mut self) -> io::Result<i32> {
    self.fill_at_least(4)?;
    Ok(self.read_buf.get_i32())
  }

  /// Reads a NUL-terminated string, returning it without the terminator.
  pub fn read_cstring(&mut self) -> io::Result<String> {
    let mut out = Vec::new();
    loop {
      let b = self.read_u8()?;
      if b == 0 {
        break;
      }
      out.push(b);
    }
    String::from_utf8(out).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
  }

  /// Reads into `buf`, short reads permitted. Drains any buffered bytes
  /// first; callers that need an exact number of bytes must loop.
  pub fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    if !self.read_buf.is_empty() {
      let n = buf.len().min(self.read_buf.len());
      self.read_buf.copy_to_slice(&mut buf[..n]);
      return Ok(n);
    }
    self.inner.read(buf)
  }

  /// Reads exactly `buf.len()` bytes, looping on short reads.
  pub fn read_exact(&mut self, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
      let n = self.read_raw(buf)?;
      if n == 0 {
        return Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "connection closed before the expected bytes were received",
        ));
      }
      buf = &mut buf[n..];
    }
    Ok(())
  }

  pub fn write_u8(&mut self, val: u8) -> io::Result<usize> {
    self.write_buf.extend_from_slice(&[val]);
    Ok(1)
  }

  pub fn write_i16(&mut self, val: i16) -> io::Result<usize> {
    self.write_buf.extend_from_slice(&val.to_be_bytes());
    Ok(2)
  }

  pub fn write_i32(&mut self, val: i32) -> io::Result<usize> {
    self.write_buf.extend_from_slice(&val.to_be_bytes());
    Ok(4)
  }

  /// Writes `s`'s raw bytes followed by a single zero octet.
  pub fn write_cstring(&mut self, s: &str) -> io::Result<usize> {
    self.write_buf.extend_from_slice(s.as_bytes());
    self.write_buf.extend_from_slice(&[0]);
    Ok(s.len() + 1)
  }

  pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<usize> {
    self.write_buf.extend_from_slice(bytes);
    Ok(bytes.len())
  }

  /// Drains the write buffer to the transport.
  pub fn flush(&mut self) -> io::Result<()> {
    self.inner.write_all(&self.write_buf)?;
    self.write_buf.clear();
    self.inner.flush()
  }
}
