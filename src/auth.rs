//! Authentication subtype handling for the startup/auth phase of
//! [`crate::connection::Connection::connect`].
//!
//! The default [`Authenticator`] handles the subtypes a server will pick
//! for a plain password-based role: `AuthenticationOk`, Cleartext, and MD5.
//! SCRAM-SHA-256 is offered as a separate, pluggable implementation in
//! [`scram`] since it pulls in a heavier crypto dependency than most
//! deployments need.

use std::io::{Read, Write};

use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::protocol::ProtocolStream;

/// Authentication subtype codes carried by the first `Int32` of an
/// `AuthenticationXXX` message.
pub mod subtype {
  pub const OK: i32 = 0;
  pub const KERBEROS_V5: i32 = 2;
  pub const CLEARTEXT: i32 = 3;
  pub const MD5: i32 = 5;
  pub const SCM_CREDENTIAL: i32 = 6;
  pub const GSS: i32 = 7;
  pub const GSS_CONTINUE: i32 = 8;
  pub const SSPI: i32 = 9;
  pub const SASL: i32 = 10;
  pub const SASL_CONTINUE: i32 = 11;
  pub const SASL_FINAL: i32 = 12;
}

/// Handles one `AuthenticationXXX` message, optionally writing a response
/// and returning whether authentication is now complete.
pub trait Authenticator<T> {
  fn handle(
    &mut self,
    stream: &mut ProtocolStream<T>,
    subtype: i32,
    body: &[u8],
    user: &str,
    password: Option<&str>,
  ) -> Result<bool>;
}

/// Cleartext and MD5 password authentication, the two subtypes a server
/// offers a plain `password`-authenticated role.
#[derive(Debug, Default, Clone, Copy)]
pub struct PasswordAuthenticator;

impl<T> Authenticator<T> for PasswordAuthenticator
where
  T: Read + Write,
{
  fn handle(
    &mut self,
    stream: &mut ProtocolStream<T>,
    subtype: i32,
    body: &[u8],
    user: &str,
    password: Option<&str>,
  ) -> Result<bool> {
    match subtype {
      subtype::OK => Ok(true),
      subtype::CLEARTEXT => {
        let password = password
          .ok_or_else(|| Error::protocol_state("server requires a password"))?;
        stream.send_password(password)?;
        stream.flush()?;
        Ok(false)
      }
      subtype::MD5 => {
        let password = password
          .ok_or_else(|| Error::protocol_state("server requires a password"))?;
        if body.len() != 4 {
          return Err(Error::framing("AuthenticationMD5Password: bad salt length"));
        }
        let hashed = md5_password(user, password, body);
        stream.send_password(&hashed)?;
        stream.flush()?;
        Ok(false)
      }
      subtype::KERBEROS_V5 => Err(Error::UnsupportedAuthSubtype(subtype)),
      subtype::SCM_CREDENTIAL => Err(Error::UnsupportedAuthSubtype(subtype)),
      subtype::GSS | subtype::GSS_CONTINUE => Err(Error::UnsupportedAuthSubtype(subtype)),
      subtype::SSPI => Err(Error::UnsupportedAuthSubtype(subtype)),
      subtype::SASL => Err(Error::protocol_state(
        "server offered SASL; use scram::ScramAuthenticator",
      )),
      other => Err(Error::UnsupportedAuthSubtype(other)),
    }
  }
}

/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`.
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
  let mut md5 = Md5::new();
  md5.update(password.as_bytes());
  md5.update(user.as_bytes());
  let inner = md5.finalize_reset();
  md5.update(format!("{:x}", inner));
  md5.update(salt);
  format!("md5{:x}", md5.finalize())
}

/// SCRAM-SHA-256 (RFC 5802 / RFC 7677), offered separately from
/// [`PasswordAuthenticator`] since most deployments never exercise it.
pub mod scram {
  use super::*;
  use base64::{decode as b64decode, encode as b64encode};
  use hmac::{Hmac, Mac};
  use rand::distributions::Alphanumeric;
  use rand::{thread_rng, Rng};
  use sha2::digest::FixedOutput;
  use sha2::{Digest, Sha256};

  const MECHANISM: &str = "SCRAM-SHA-256";
  const GS2_HEADER: &str = "n,,";

  /// Drives the full SASL exchange for `SCRAM-SHA-256`. Channel binding
  /// (`-PLUS`) is not implemented; the client always advertises `n,,`.
  #[derive(Debug, Default, Clone, Copy)]
  pub struct ScramAuthenticator;

  impl ScramAuthenticator {
    /// Handles an `AuthenticationSASL` message (`body` is the list of
    /// server-advertised mechanisms) through to completion, consuming
    /// the subsequent `AuthenticationSASLContinue` and
    /// `AuthenticationSASLFinal` messages itself.
    pub fn authenticate<T>(
      &mut self,
      stream: &mut ProtocolStream<T>,
      mechanisms_body: &[u8],
      user: &str,
      password: &str,
    ) -> Result<()>
    where
      T: Read + Write,
    {
      let mechanisms = parse_cstring_list(mechanisms_body)?;
      if !mechanisms.iter().any(|m| m == MECHANISM) {
        return Err(Error::protocol_state(
          "server did not offer SCRAM-SHA-256",
        ));
      }

      let client_nonce: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();

      let client_first_message = format!("n=,r={}", client_nonce);
      send_sasl_initial(stream, MECHANISM, &client_first_message)?;

      let server_first_message = read_sasl_continue(stream)?;
      let mut chunks = server_first_message.splitn(3, ',');
      let server_nonce = chunks
        .next()
        .and_then(|v| v.strip_prefix("r="))
        .ok_or_else(|| Error::protocol_state("SCRAM: missing server nonce"))?;
      let salt: Vec<u8> = chunks
        .next()
        .and_then(|v| v.strip_prefix("s="))
        .and_then(|v| b64decode(v).ok())
        .ok_or_else(|| Error::protocol_state("SCRAM: missing or invalid salt"))?;
      let iteration_count: usize = chunks
        .next()
        .and_then(|v| v.strip_prefix("i="))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::protocol_state("SCRAM: missing iteration count"))?;

      let salted_password = sasl_hi(password.as_bytes(), &salt, iteration_count);

      let client_key = hmac_sha256(&salted_password, b"Client Key");
      let stored_key = Sha256::default().chain_update(client_key.as_slice()).finalize_fixed();

      let channel_binding = b64encode(GS2_HEADER.as_bytes());
      let auth_message = format!(
        "n=,r={},{},c={},r={}",
        client_nonce, server_first_message, channel_binding, server_nonce
      );

      let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
      let mut client_proof = client_key;
      for (p, s) in client_proof.iter_mut().zip(client_signature) {
        *p ^= s;
      }

      let client_final_message = format!(
        "c={},r={},p={}",
        channel_binding,
        server_nonce,
        b64encode(client_proof)
      );
      stream.send_raw_password_message(client_final_message.as_bytes())?;
      stream.flush()?;

      let final_response = read_sasl_final(stream)?;
      if let Some(err) = final_response.strip_prefix("e=") {
        return Err(Error::protocol_state(format!("SCRAM authentication failed: {err}")));
      }
      let verifier = final_response
        .strip_prefix("v=")
        .ok_or_else(|| Error::protocol_state("SCRAM: unexpected final message"))?;
      let verifier = b64decode(verifier)
        .map_err(|_| Error::protocol_state("SCRAM: invalid base64 in final verifier"))?;

      let server_key = hmac_sha256(&salted_password, b"Server Key");
      Hmac::<Sha256>::new_from_slice(&server_key)
        .expect("HMAC accepts any key length")
        .chain_update(auth_message.as_bytes())
        .verify_slice(&verifier)
        .map_err(|_| Error::protocol_state("SCRAM: server signature verification failed"))?;

      Ok(())
    }
  }

  impl<T> Authenticator<T> for ScramAuthenticator
  where
    T: Read + Write,
  {
    fn handle(
      &mut self,
      stream: &mut ProtocolStream<T>,
      subtype: i32,
      body: &[u8],
      user: &str,
      password: Option<&str>,
    ) -> Result<bool> {
      match subtype {
        super::subtype::OK => Ok(true),
        super::subtype::SASL => {
          let password = password
            .ok_or_else(|| Error::protocol_state("server requires a password"))?;
          self.authenticate(stream, body, user, password)?;
          // AuthenticationSASLFinal is not itself AuthenticationOk;
          // the server still sends a trailing AuthenticationOk that
          // the outer loop will dispatch back to this same handler.
          Ok(false)
        }
        other => Err(Error::UnsupportedAuthSubtype(other)),
      }
    }
  }

  fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    Hmac::<Sha256>::new_from_slice(key)
      .expect("HMAC accepts any key length")
      .chain_update(data)
      .finalize()
      .into_bytes()
      .into()
  }

  fn sasl_hi(password: &[u8], salt: &[u8], iterations: usize) -> [u8; 32] {
    let mut prev: [u8; 32] = Hmac::<Sha256>::new_from_slice(password)
      .expect("HMAC accepts any key length")
      .chain_update(salt)
      .chain_update([0, 0, 0, 1])
      .finalize()
      .into_bytes()
      .into();
    let mut hi = prev;
    for _ in 1..iterations {
      prev = hmac_sha256(password, &prev);
      for (h, p) in hi.iter_mut().zip(prev) {
        *h ^= p;
      }
    }
    hi
  }

  fn parse_cstring_list(body: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in body.iter().enumerate() {
      if *b == 0 {
        if i == start {
          break;
        }
        out.push(
          String::from_utf8(body[start..i].to_vec())
            .map_err(|e| Error::framing(e.to_string()))?,
        );
        start = i + 1;
      }
    }
    Ok(out)
  }

  fn send_sasl_initial<T>(stream: &mut ProtocolStream<T>, mechanism: &str, first_message: &str) -> Result<()>
  where
    T: Read + Write,
  {
    // PasswordMessage's body doesn't fit: SASLInitialResponse needs the
    // mechanism name and an explicit response length, so it's built by
    // hand here rather than through send_password.
    use bytes::BufMut;
    let mut body = bytes::BytesMut::new();
    body.put_slice(mechanism.as_bytes());
    body.put_u8(0);
    body.put_i32(first_message.len() as i32);
    body.put_slice(first_message.as_bytes());
    stream.send_raw_password_message(&body)?;
    stream.flush()
  }

  fn read_sasl_continue<T>(stream: &mut ProtocolStream<T>) -> Result<String>
  where
    T: Read + Write,
  {
    expect_auth_tag(stream)?;
    let (subtype, body) = stream.receive_auth_response()?;
    if subtype != super::subtype::SASL_CONTINUE {
      return Err(Error::protocol_state("expected AuthenticationSASLContinue"));
    }
    String::from_utf8(body).map_err(|e| Error::framing(e.to_string()))
  }

  fn read_sasl_final<T>(stream: &mut ProtocolStream<T>) -> Result<String>
  where
    T: Read + Write,
  {
    expect_auth_tag(stream)?;
    let (subtype, body) = stream.receive_auth_response()?;
    if subtype != super::subtype::SASL_FINAL {
      return Err(Error::protocol_state("expected AuthenticationSASLFinal"));
    }
    String::from_utf8(body).map_err(|e| Error::framing(e.to_string()))
  }

  fn expect_auth_tag<T>(stream: &mut ProtocolStream<T>) -> Result<()>
  where
    T: Read + Write,
  {
    use crate::message::tag;
    let got = stream.next_tag()?;
    if got != tag::AUTHENTICATION {
      return Err(Error::unexpected_tag("AuthenticationXXX", got));
    }
    Ok(())
  }

}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn md5_password_matches_known_vector() {
    // md5(md5("secretuser") + salt) with salt = [0,0,0,0]
    let got = md5_password("user", "secret", &[0, 0, 0, 0]);
    assert!(got.starts_with("md5"));
    assert_eq!(got.len(), 3 + 32);
  }

  #[test]
  fn scram_ok_subtype_completes_without_touching_stream() {
    use crate::testutil::Loopback;
    let mut stream = ProtocolStream::new(Loopback::new(Vec::new()));
    let mut auth = scram::ScramAuthenticator;
    let done = Authenticator::handle(&mut auth, &mut stream, subtype::OK, &[], "alice", None)
      .unwrap();
    assert!(done);
  }

  #[test]
  fn scram_rejects_unsupported_subtype() {
    use crate::testutil::Loopback;
    let mut stream = ProtocolStream::new(Loopback::new(Vec::new()));
    let mut auth = scram::ScramAuthenticator;
    let err = Authenticator::handle(
      &mut auth,
      &mut stream,
      subtype::GSS,
      &[],
      "alice",
      None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnsupportedAuthSubtype(_)));
  }

  #[test]
  fn scram_sasl_requires_password() {
    use crate::testutil::Loopback;
    let mut stream = ProtocolStream::new(Loopback::new(Vec::new()));
    let mut auth = scram::ScramAuthenticator;
    let err = Authenticator::handle(
      &mut auth,
      &mut stream,
      subtype::SASL,
      b"SCRAM-SHA-256\0",
      "alice",
      None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ProtocolState(_)));
  }
}
