//! Streaming result-set iterator (spec §4.6): owns the protocol stream
//! between query submission and the terminating `ReadyForQuery`, and
//! delegates per-column decoding to the connection's codec registry.

use std::any::Any;
use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use crate::connection::{next_filtered, peek_filtered, Shared};
use crate::error::{Error, Result};
use crate::message::{tag, FieldDescription};
use crate::protocol::ProtocolStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
  PreInit,
  Streaming,
  Between,
  Drained,
  Failed,
}

/// A single outstanding result-set iterator, created by
/// [`crate::connection::Connection::simple_query`].
pub struct RowCursor<T> {
  stream: Option<ProtocolStream<T>>,
  shared: Rc<RefCell<Shared<T>>>,
  state: CursorState,
  fields: Vec<FieldDescription>,
  has_row: bool,
  last_command_tag: Option<String>,
  last_err: Option<Error>,
  closed: bool,
}

impl<T> RowCursor<T>
where
  T: Read + Write,
{
  pub(crate) fn new(stream: ProtocolStream<T>, shared: Rc<RefCell<Shared<T>>>) -> Self {
    Self {
      stream: Some(stream),
      shared,
      state: CursorState::PreInit,
      fields: Vec::new(),
      has_row: false,
      last_command_tag: None,
      last_err: None,
      closed: false,
    }
  }

  fn stream_mut(&mut self) -> &mut ProtocolStream<T> {
    self.stream.as_mut().expect("cursor holds the stream until close")
  }

  fn fail(&mut self, err: Error) {
    self.state = CursorState::Failed;
    self.last_err = Some(err);
  }

  /// The most recent fatal error recorded for this cursor, if any.
  pub fn err(&self) -> Option<&Error> {
    self.last_err.as_ref()
  }

  /// The command tag of the most recently completed result set (e.g.
  /// `"SELECT 1"`), available once a `CommandComplete` has been observed.
  pub fn command_tag(&self) -> Option<&str> {
    self.last_command_tag.as_deref()
  }

  fn ensure_init(&mut self) {
    if self.state != CursorState::PreInit {
      return;
    }
    if let Err(err) = self.initialize() {
      self.fail(err);
    }
  }

  /// Reads the field descriptors for the current result set, triggering
  /// initialization on first use. Empty if initialization failed; inspect
  /// [`Self::err`] in that case.
  pub fn fields(&mut self) -> &[FieldDescription] {
    self.ensure_init();
    &self.fields
  }

  /// Pre-init → Streaming | Drained, or a recorded failure.
  fn initialize(&mut self) -> Result<bool> {
    let shared = self.shared.clone();
    let stream = self.stream_mut();
    let found = peek_filtered(stream, &shared)?;
    match found {
      tag::ROW_DESCRIPTION => {
        stream.next_tag()?;
        let fields = stream.receive_row_description()?;
        // Fields must be visible via `fields()` even if a column's
        // decoder is missing below, so this is assigned before the
        // lookup loop can fail the whole initialization.
        self.fields = fields;
        self.has_row = false;
        self.last_command_tag = None;
        {
          let registry = &shared.borrow().codec_registry;
          for f in &self.fields {
            registry.lookup(f.format, f.type_oid)?;
          }
        }
        self.state = CursorState::Streaming;
        #[cfg(feature = "log-verbose")]
        log::trace!("cursor: {} column(s) in result set", self.fields.len());
        Ok(true)
      }
      tag::COPY_IN_RESPONSE | tag::COPY_OUT_RESPONSE | tag::COPY_BOTH_RESPONSE => {
        stream.next_tag()?;
        let _ = stream.receive_copy_response(found)?;
        Err(Error::CopyUnsupported)
      }
      tag::EMPTY_QUERY_RESPONSE => {
        stream.next_tag()?;
        stream.receive_empty(tag::EMPTY_QUERY_RESPONSE)?;
        Err(Error::EmptyQuery)
      }
      tag::ERROR_RESPONSE => {
        stream.next_tag()?;
        let err = stream.receive_error_response()?;
        Err(err.into())
      }
      tag::READY_FOR_QUERY => {
        stream.next_tag()?;
        let status = stream.receive_ready_for_query()?;
        shared.borrow_mut().tx_status = status;
        self.state = CursorState::Drained;
        Ok(false)
      }
      other => {
        stream.next_tag()?;
        Err(Error::unexpected_tag("RowDescription/CopyResponse/EmptyQueryResponse/ErrorResponse", other))
      }
    }
  }

  /// Discards the pending `DataRow` still sitting in the peek slot,
  /// without invoking the codec registry.
  fn drain_pending_row(&mut self) -> Result<()> {
    let stream = self.stream_mut();
    stream.next_tag()?;
    stream.receive_data_row(|_col, source, length| {
      if length < 0 {
        return Ok(());
      }
      let mut scratch = [0u8; 1024];
      let mut remaining = length as usize;
      while remaining > 0 {
        let want = remaining.min(scratch.len());
        let n = source.read(&mut scratch[..want]).map_err(Error::from)?;
        if n == 0 {
          return Err(Error::framing("connection closed mid-field while discarding a row"));
        }
        remaining -= n;
      }
      Ok(())
    })?;
    self.has_row = false;
    Ok(())
  }

  /// Advances to the next row of the current result set. Returns `false`
  /// at the end of the result set, on error (see [`Self::err`]), or while
  /// `Between` results awaiting [`Self::next_result`].
  pub fn next(&mut self) -> bool {
    if self.state == CursorState::PreInit {
      self.ensure_init();
    }
    match self.state {
      CursorState::Failed | CursorState::Drained | CursorState::Between => return false,
      CursorState::PreInit => return false,
      CursorState::Streaming => {}
    }

    if self.has_row {
      if let Err(err) = self.drain_pending_row() {
        self.fail(err);
        return false;
      }
    }

    let shared = self.shared.clone();
    let found = match peek_filtered(self.stream_mut(), &shared) {
      Ok(t) => t,
      Err(err) => {
        self.fail(err);
        return false;
      }
    };

    match found {
      tag::DATA_ROW => {
        self.has_row = true;
        true
      }
      tag::COMMAND_COMPLETE => {
        let stream = self.stream_mut();
        let result = stream.next_tag().and_then(|_| stream.receive_command_complete());
        match result {
          Ok(command_tag) => {
            #[cfg(feature = "log")]
            log::debug!("cursor: {command_tag}");
            self.last_command_tag = Some(command_tag);
            self.state = CursorState::Between;
            false
          }
          Err(err) => {
            self.fail(err);
            false
          }
        }
      }
      tag::ERROR_RESPONSE => {
        let stream = self.stream_mut();
        let result = stream.next_tag().and_then(|_| stream.receive_error_response());
        match result {
          Ok(pg_err) => {
            #[cfg(feature = "log")]
            log::error!("{pg_err}");
            self.fail(pg_err.into());
            false
          }
          Err(err) => {
            self.fail(err);
            false
          }
        }
      }
      other => {
        let _ = self.stream_mut().next_tag();
        self.fail(Error::unexpected_tag("DataRow/CommandComplete/ErrorResponse", other));
        false
      }
    }
  }

  /// Allocates and returns one value per column via the codec registry's
  /// "produce" capability; `None` for SQL NULL.
  pub fn get(&mut self) -> Result<Vec<Option<Box<dyn Any>>>> {
    if !self.has_row {
      return Err(Error::NoRow);
    }
    let fields = self.fields.clone();
    let shared = self.shared.clone();
    let mut values: Vec<Option<Box<dyn Any>>> = Vec::with_capacity(fields.len());
    let stream = self.stream_mut();
    let outcome = stream.receive_data_row(|col, source, length| {
      let idx = (col - 1) as usize;
      if length < 0 {
        values.push(None);
        return Ok(());
      }
      let field = &fields[idx];
      let borrowed = shared.borrow();
      let decoder = borrowed.codec_registry.lookup(field.format, field.type_oid)?;
      let value = decoder.decode(source, length)?;
      values.push(Some(value));
      Ok(())
    });
    self.has_row = false;
    outcome?;
    Ok(values)
  }

  /// Writes each non-NULL column into the matching destination via the
  /// codec registry's "write in place" capability. Returns the null mask.
  /// `destinations` must have exactly one entry per field and no `None`
  /// (absent/nil) entries.
  pub fn scan(&mut self, destinations: &mut [Option<&mut dyn Any>]) -> Result<Vec<bool>> {
    if !self.has_row {
      return Err(Error::NoRow);
    }
    if destinations.len() != self.fields.len() {
      return Err(Error::ScanArityMismatch {
        expected: self.fields.len(),
        got: destinations.len(),
      });
    }
    for (i, dest) in destinations.iter().enumerate() {
      if dest.is_none() {
        return Err(Error::ScanNilDestination(i));
      }
    }

    let fields = self.fields.clone();
    let shared = self.shared.clone();
    let mut nulls = vec![false; fields.len()];
    let mut dests = destinations;
    let stream = self.stream_mut();
    let outcome = stream.receive_data_row(|col, source, length| {
      let idx = (col - 1) as usize;
      if length < 0 {
        nulls[idx] = true;
        return Ok(());
      }
      let field = &fields[idx];
      let borrowed = shared.borrow();
      let decoder = borrowed.codec_registry.lookup(field.format, field.type_oid)?;
      let dest = dests[idx].as_deref_mut().expect("validated non-nil above");
      decoder.decode_into(source, length, dest)?;
      Ok(())
    });
    self.has_row = false;
    outcome?;
    Ok(nulls)
  }

  /// Drains the current result set, then attempts to initialize the next
  /// one within this `simple_query` submission.
  pub fn next_result(&mut self) -> bool {
    while self.next() {}
    match self.state {
      CursorState::Failed | CursorState::Drained => false,
      _ => {
        self.state = CursorState::PreInit;
        match self.initialize() {
          Ok(has_fields) => has_fields,
          Err(err) => {
            self.fail(err);
            false
          }
        }
      }
    }
  }

  /// Drains any remaining result sets and absorbs messages through
  /// `ReadyForQuery`, then returns the stream to the connection.
  /// Idempotent after the first successful call.
  pub fn close(&mut self) -> Result<()> {
    if self.closed {
      return Ok(());
    }
    let result = self.drain_to_ready_for_query();
    self.closed = true;
    if let Some(stream) = self.stream.take() {
      self.shared.borrow_mut().stream = Some(stream);
    }
    result
  }

  fn drain_to_ready_for_query(&mut self) -> Result<()> {
    loop {
      match self.state {
        CursorState::Drained => return Ok(()),
        CursorState::Failed => {
          // A fatal error was already recorded; still drain to
          // ReadyForQuery so the connection's stream is left in a
          // recoverable position for the next query.
          return self.drain_after_failure();
        }
        CursorState::PreInit => {
          if let Err(err) = self.initialize() {
            self.fail(err);
            return self.drain_after_failure();
          }
        }
        CursorState::Streaming | CursorState::Between => {
          while self.next() {}
          if self.state == CursorState::Between {
            self.state = CursorState::PreInit;
          }
        }
      }
    }
  }

  /// After a fatal error, keep absorbing messages (including further
  /// ErrorResponses) until ReadyForQuery, so the connection's stream is
  /// left in a recoverable position.
  fn drain_after_failure(&mut self) -> Result<()> {
    loop {
      let shared = self.shared.clone();
      let found = next_filtered(self.stream_mut(), &shared)?;
      match found {
        tag::READY_FOR_QUERY => {
          let status = self.stream_mut().receive_ready_for_query()?;
          shared.borrow_mut().tx_status = status;
          self.state = CursorState::Drained;
          return Ok(());
        }
        tag::ERROR_RESPONSE => {
          self.stream_mut().receive_error_response()?;
        }
        tag::DATA_ROW => {
          self.stream_mut().receive_data_row(|_, source, length| {
            if length < 0 {
              return Ok(());
            }
            let mut scratch = [0u8; 1024];
            let mut remaining = length as usize;
            while remaining > 0 {
              let want = remaining.min(scratch.len());
              let n = source.read(&mut scratch[..want]).map_err(Error::from)?;
              if n == 0 {
                return Err(Error::framing("connection closed mid-field while draining"));
              }
              remaining -= n;
            }
            Ok(())
          })?;
        }
        tag::COMMAND_COMPLETE => {
          self.stream_mut().receive_command_complete()?;
        }
        tag::ROW_DESCRIPTION => {
          self.stream_mut().receive_row_description()?;
        }
        tag::EMPTY_QUERY_RESPONSE => {
          self.stream_mut().receive_empty(tag::EMPTY_QUERY_RESPONSE)?;
        }
        other => return Err(Error::unexpected_tag("draining after failure", other)),
      }
    }
  }
}
