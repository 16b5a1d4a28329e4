//! Pluggable column decoding: a two-level registry keyed by wire format and
//! type OID, with a built-in text decoder for the handful of types a
//! protocol-level client needs without any catalog lookup.

use std::collections::HashMap;
use std::io::Read;

use crate::error::{Error, Result};
use crate::message::Format;

/// Well-known type OIDs decodable as text without catalog access.
pub mod oid {
  pub const BOOL: u32 = 16;
  pub const NAME: u32 = 19;
  pub const INT8: u32 = 20;
  pub const INT2: u32 = 21;
  pub const INT4: u32 = 23;
  pub const TEXT: u32 = 25;
  pub const FLOAT4: u32 = 700;
  pub const FLOAT8: u32 = 701;
  pub const UNKNOWN: u32 = 705;
  pub const BPCHAR: u32 = 1042;
  pub const VARCHAR: u32 = 1043;
}

/// A column decoder, capable of either allocating a fresh value
/// ([`decode`][Decoder::decode], backing [`RowCursor::get`]) or writing into
/// a caller-supplied destination ([`decode_into`][Decoder::decode_into],
/// backing [`RowCursor::scan`]).
///
/// `source` yields exactly `length` bytes (already bounded by the framing
/// layer); implementations must not assume NUL termination even for text
/// formats.
pub trait Decoder: Send + Sync {
  /// Allocates and returns a boxed `Any` value for `RowCursor::get`.
  fn decode(&self, source: &mut dyn Read, length: i32) -> Result<Box<dyn std::any::Any>>;

  /// Writes the decoded value into `dest`, downcast from `&mut dyn Any`,
  /// for `RowCursor::scan`. Returns an error if `dest`'s concrete type
  /// doesn't match what this decoder produces.
  fn decode_into(&self, source: &mut dyn Read, length: i32, dest: &mut dyn std::any::Any) -> Result<()>;
}

/// Decodes any text-format column into a `String`, trusting the server's
/// client encoding to already be UTF-8 compatible (the common case).
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDecoder;

impl TextDecoder {
  fn read_all(source: &mut dyn Read, length: i32) -> Result<String> {
    let mut buf = vec![0u8; length.max(0) as usize];
    if !buf.is_empty() {
      std::io::Read::read_exact(source, &mut buf).map_err(Error::from)?;
    }
    String::from_utf8(buf).map_err(|e| Error::Decode(Box::new(e)))
  }
}

impl Decoder for TextDecoder {
  fn decode(&self, source: &mut dyn Read, length: i32) -> Result<Box<dyn std::any::Any>> {
    Ok(Box::new(Self::read_all(source, length)?))
  }

  fn decode_into(&self, source: &mut dyn Read, length: i32, dest: &mut dyn std::any::Any) -> Result<()> {
    let value = Self::read_all(source, length)?;
    match dest.downcast_mut::<String>() {
      Some(slot) => {
        *slot = value;
        Ok(())
      }
      None => match dest.downcast_mut::<Option<String>>() {
        Some(slot) => {
          *slot = Some(value);
          Ok(())
        }
        None => Err(Error::protocol_state(
          "scan destination is not a String or Option<String>",
        )),
      },
    }
  }
}

/// Two-level `(format, type_oid) -> Decoder` map consulted by
/// [`crate::cursor::RowCursor`] for every column on first use.
///
/// Built with the built-in text decoder already registered for
/// `{Text, Varchar, Bpchar, Unknown, Name}`; callers add their own for any
/// other OID (including all binary-format types, which this crate does not
/// decode natively).
pub struct CodecRegistry {
  decoders: HashMap<(Format, u32), Box<dyn Decoder>>,
}

impl CodecRegistry {
  /// An empty registry with no built-ins; prefer [`Self::with_defaults`]
  /// unless you intend to fully own the decoder set.
  pub fn new() -> Self {
    Self {
      decoders: HashMap::new(),
    }
  }

  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    for type_oid in [oid::TEXT, oid::VARCHAR, oid::BPCHAR, oid::UNKNOWN, oid::NAME] {
      registry.register(Format::Text, type_oid, TextDecoder);
    }
    registry
  }

  pub fn register(&mut self, format: Format, type_oid: u32, decoder: impl Decoder + 'static) {
    self.decoders.insert((format, type_oid), Box::new(decoder));
  }

  pub fn lookup(&self, format: Format, type_oid: u32) -> Result<&dyn Decoder> {
    self.decoders
      .get(&(format, type_oid))
      .map(Box::as_ref)
      .ok_or(Error::MissingDecoder { type_oid, format })
  }
}

impl Default for CodecRegistry {
  fn default() -> Self {
    Self::with_defaults()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn text_decoder_get_roundtrip() {
    let registry = CodecRegistry::with_defaults();
    let decoder = registry.lookup(Format::Text, oid::TEXT).unwrap();
    let mut src = Cursor::new(b"hello".to_vec());
    let value = decoder.decode(&mut src, 5).unwrap();
    assert_eq!(*value.downcast::<String>().unwrap(), "hello");
  }

  #[test]
  fn text_decoder_scan_into_string() {
    let registry = CodecRegistry::with_defaults();
    let decoder = registry.lookup(Format::Text, oid::VARCHAR).unwrap();
    let mut src = Cursor::new(b"world".to_vec());
    let mut dest = String::new();
    decoder.decode_into(&mut src, 5, &mut dest).unwrap();
    assert_eq!(dest, "world");
  }

  #[test]
  fn missing_decoder_errors() {
    let registry = CodecRegistry::with_defaults();
    let err = registry.lookup(Format::Binary, oid::INT4).unwrap_err();
    assert!(matches!(err, Error::MissingDecoder { .. }));
  }
}
