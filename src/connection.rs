//! Startup, authentication and the simple-query entry point: the state
//! machine described in spec §4.3, plus the async-message filter (§4.5)
//! shared with [`crate::cursor::RowCursor`].

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::rc::Rc;

use crate::auth::Authenticator;
use crate::codec::CodecRegistry;
use crate::error::{Error, Result};
use crate::message::{tag, BackendKeyData, Notification, PgNotice, TransactionStatus};
use crate::protocol::{ProtocolStream, SslResponse};

/// State shared between a [`Connection`] and the [`crate::cursor::RowCursor`]
/// it hands stream control to. `stream` is `None` whenever a cursor has
/// taken it; `Connection::simple_query` refuses a second query while that
/// holds.
pub(crate) struct Shared<T> {
  pub(crate) stream: Option<ProtocolStream<T>>,
  pub(crate) parameters: BTreeMap<String, String>,
  pub(crate) backend_key: Option<BackendKeyData>,
  pub(crate) tx_status: TransactionStatus,
  pub(crate) notices: VecDeque<PgNotice>,
  pub(crate) notifications: VecDeque<Notification>,
  pub(crate) codec_registry: CodecRegistry,
}

/// Convenience builder for the `options` map `connect` expects
/// (user/password/database).
#[derive(Debug, Clone)]
pub struct StartupOptions {
  pub user: String,
  pub password: Option<String>,
  pub database: Option<String>,
  pub extra: BTreeMap<String, String>,
}

impl Default for StartupOptions {
  fn default() -> Self {
    Self {
      user: "postgres".to_string(),
      password: None,
      database: None,
      extra: BTreeMap::new(),
    }
  }
}

impl StartupOptions {
  pub fn new(user: impl Into<String>) -> Self {
    Self {
      user: user.into(),
      ..Default::default()
    }
  }

  pub fn password(mut self, password: impl Into<String>) -> Self {
    self.password = Some(password.into());
    self
  }

  pub fn database(mut self, database: impl Into<String>) -> Self {
    self.database = Some(database.into());
    self
  }

  pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.extra.insert(key.into(), value.into());
    self
  }

  /// Builds the `key -> value` map `Connection::connect` sends in the
  /// startup message.
  pub fn to_map(&self) -> BTreeMap<String, String> {
    let mut map = self.extra.clone();
    map.insert("user".to_string(), self.user.clone());
    if let Some(db) = &self.database {
      map.insert("database".to_string(), db.clone());
    }
    map
  }
}

/// Result of [`Connection::negotiate_tls`]: either the caller's upgrade
/// closure ran and produced a new transport, or the server declined and the
/// original transport is handed back untouched.
pub enum NegotiatedTransport<T, T2> {
  Tls(T2),
  Plain(T),
}

/// A single-threaded connection to one backend, owning the wire protocol
/// stream (or having relinquished it to an outstanding [`RowCursor`]).
pub struct Connection<T> {
  shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Connection<T>
where
  T: Read + Write,
{
  /// Wraps a raw transport; does not perform startup. Matches
  /// `new_connection(transport, codec_registry)` in spec §6.
  pub fn new(transport: T, codec_registry: CodecRegistry) -> Self {
    Self {
      shared: Rc::new(RefCell::new(Shared {
        stream: Some(ProtocolStream::new(transport)),
        parameters: BTreeMap::new(),
        backend_key: None,
        tx_status: TransactionStatus::Idle,
        notices: VecDeque::new(),
        notifications: VecDeque::new(),
        codec_registry,
      })),
    }
  }

  /// Sends `SSLRequest` and reads the single-octet response. Leaves the
  /// decision of what to do next entirely to the caller: this never
  /// touches TLS itself, since the core has no TLS dependency.
  pub fn negotiate_tls<T2>(
    transport: T,
    upgrade: impl FnOnce(T) -> Result<T2>,
  ) -> Result<NegotiatedTransport<T, T2>>
  where
    T2: Read + Write,
  {
    let mut stream = ProtocolStream::new(transport);
    stream.send_ssl_request()?;
    stream.flush()?;
    match stream.receive_ssl_response()? {
      SslResponse::Accepted => Ok(NegotiatedTransport::Tls(upgrade(stream.into_inner())?)),
      SslResponse::Rejected => Ok(NegotiatedTransport::Plain(stream.into_inner())),
    }
  }

  /// Runs the startup/authentication exchange of spec §4.3 to completion.
  pub fn connect<A>(&mut self, options: &StartupOptions, mut authenticator: A) -> Result<()>
  where
    A: Authenticator<T>,
  {
    if !options.to_map().contains_key("user") {
      return Err(Error::protocol_state("startup options must include user"));
    }

    {
      let mut shared = self.shared.borrow_mut();
      let stream = shared
        .stream
        .as_mut()
        .ok_or_else(|| Error::protocol_state("connection has no stream"))?;
      stream.send_startup(&options.to_map())?;
      stream.flush()?;
    }

    self.authenticate(&options.user, options.password.as_deref(), &mut authenticator)?;
    self.await_ready_for_query()
  }

  fn authenticate<A>(
    &mut self,
    user: &str,
    password: Option<&str>,
    authenticator: &mut A,
  ) -> Result<()>
  where
    A: Authenticator<T>,
  {
    loop {
      let mut shared = self.shared.borrow_mut();
      let stream = shared.stream.as_mut().expect("stream present during connect");
      let read_tag = stream.next_tag()?;
      match read_tag {
        tag::AUTHENTICATION => {
          let (subtype, body) = stream.receive_auth_response()?;
          if authenticator.handle(stream, subtype, &body, user, password)? {
            return Ok(());
          }
        }
        tag::ERROR_RESPONSE => {
          let err = stream.receive_error_response()?;
          return Err(err.into());
        }
        other => return Err(Error::unexpected_tag("AuthenticationResponse", other)),
      }
    }
  }

  fn await_ready_for_query(&mut self) -> Result<()> {
    loop {
      let mut shared = self.shared.borrow_mut();
      let stream = shared.stream.as_mut().expect("stream present during connect");
      let read_tag = stream.next_tag()?;
      match read_tag {
        tag::PARAMETER_STATUS => {
          let (name, value) = stream.receive_parameter_status()?;
          shared.parameters.insert(name, value);
        }
        tag::BACKEND_KEY_DATA => {
          if shared.backend_key.is_some() {
            return Err(Error::protocol_state("duplicate BackendKeyData"));
          }
          let key = stream.receive_backend_key_data()?;
          shared.backend_key = Some(key);
        }
        tag::READY_FOR_QUERY => {
          let status = stream.receive_ready_for_query()?;
          shared.tx_status = status;
          #[cfg(feature = "log")]
          log::debug!("connect: ready for query ({status:?})");
          return Ok(());
        }
        tag::ERROR_RESPONSE => {
          let err = stream.receive_error_response()?;
          return Err(err.into());
        }
        tag::NOTICE_RESPONSE => {
          let notice = stream.receive_notice_response()?;
          shared.notices.push_back(notice);
        }
        tag::NOTIFICATION_RESPONSE => {
          let notification = stream.receive_notification_response()?;
          shared.notifications.push_back(notification);
        }
        other => return Err(Error::unexpected_tag("startup message", other)),
      }
    }
  }

  /// Submits a `Query` message through the simple query protocol and
  /// returns a cursor that owns the stream until it is closed.
  pub fn simple_query(&mut self, text: &str) -> Result<crate::cursor::RowCursor<T>> {
    let mut shared = self.shared.borrow_mut();
    if shared.stream.is_none() {
      return Err(Error::QueryInProgress);
    }
    let stream = shared.stream.as_mut().expect("checked above");
    stream.send_query(text)?;
    stream.flush()?;
    let taken = shared.stream.take().expect("checked above");
    drop(shared);
    Ok(crate::cursor::RowCursor::new(taken, self.shared.clone()))
  }

  pub fn parameter(&self, name: &str) -> Option<String> {
    self.shared.borrow().parameters.get(name).cloned()
  }

  pub fn backend_key(&self) -> Option<BackendKeyData> {
    self.shared.borrow().backend_key
  }

  pub fn transaction_status(&self) -> TransactionStatus {
    self.shared.borrow().tx_status
  }

  pub fn has_notification(&self) -> bool {
    !self.shared.borrow().notifications.is_empty()
  }

  pub fn next_notification(&self) -> Option<Notification> {
    self.shared.borrow_mut().notifications.pop_front()
  }

  pub fn has_notice(&self) -> bool {
    !self.shared.borrow().notices.is_empty()
  }

  pub fn next_notice(&self) -> Option<PgNotice> {
    self.shared.borrow_mut().notices.pop_front()
  }
}

/// Advances past any run of async messages (NoticeResponse,
/// NotificationResponse, ParameterStatus), leaving the next synchronous tag
/// peeked but unconsumed.
pub(crate) fn peek_filtered<T>(stream: &mut ProtocolStream<T>, shared: &Rc<RefCell<Shared<T>>>) -> Result<u8>
where
  T: Read + Write,
{
  loop {
    let next = stream.peek_tag()?;
    match next {
      tag::NOTICE_RESPONSE => {
        stream.next_tag()?;
        let notice = stream.receive_notice_response()?;
        #[cfg(feature = "log")]
        log::warn!("{notice}");
        shared.borrow_mut().notices.push_back(notice);
      }
      tag::NOTIFICATION_RESPONSE => {
        stream.next_tag()?;
        let notification = stream.receive_notification_response()?;
        #[cfg(feature = "log")]
        log::debug!("notification on channel {:?}", notification.channel);
        shared.borrow_mut().notifications.push_back(notification);
      }
      tag::PARAMETER_STATUS => {
        stream.next_tag()?;
        let (name, value) = stream.receive_parameter_status()?;
        #[cfg(feature = "log-verbose")]
        log::trace!("parameter status: {name}={value}");
        shared.borrow_mut().parameters.insert(name, value);
      }
      other => return Ok(other),
    }
  }
}

/// Like [`peek_filtered`] but consumes the resulting tag.
pub(crate) fn next_filtered<T>(stream: &mut ProtocolStream<T>, shared: &Rc<RefCell<Shared<T>>>) -> Result<u8>
where
  T: Read + Write,
{
  let found = peek_filtered(stream, shared)?;
  stream.next_tag()?;
  Ok(found)
}
