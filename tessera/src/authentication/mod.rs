//! Credential providers used during the connection handshake.
//!
//! When a server answers `STARTUP` with `AUTHENTICATE`, the connection asks the
//! configured [`AuthenticatorProvider`] for an [`AuthenticatorSession`] and runs
//! the SASL exchange with it. One session is started per connection.

use async_trait::async_trait;

/// Reason an authentication step failed, reported to the user as is.
pub type AuthError = String;

/// One SASL exchange, driven by a single connection's handshake.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an `AUTH_CHALLENGE`. The token's meaning depends on the
    /// server-side authenticator; it may be absent or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Receives the final `AUTH_SUCCESS` and its optional token.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Factory of [`AuthenticatorSession`]s, invoked once per new connection.
///
/// Set it with `SessionBuilder::authenticator_provider`, or use
/// `SessionBuilder::user` for [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Called with the authenticator class the server named in
    /// `AUTHENTICATE`. Returns the token for the first `AUTH_RESPONSE` and
    /// the session that takes over from there.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

/// Username and password, for servers running `PasswordAuthenticator`.
///
/// The credentials go out in the first `AUTH_RESPONSE`; the server is not
/// expected to challenge them further.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Sends `username` and `password` on every handshake.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// SASL PLAIN with an empty authorization id: `\0user\0password`.
    fn sasl_plain_token(&self) -> Vec<u8> {
        let parts: [&[u8]; 4] = [b"\0", self.username.as_bytes(), b"\0", self.password.as_bytes()];
        parts.concat()
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((Some(self.sasl_plain_token()), Box::new(SinglePassSession)))
    }
}

/// Everything was sent up front, so any challenge is an error.
struct SinglePassSession;

#[async_trait]
impl AuthenticatorSession for SinglePassSession {
    async fn evaluate_challenge(&mut self, _token: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Server challenged plain text credentials".to_owned())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}
