//! Response bodies and the opcodes that announce them.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use std::sync::Arc;

use bytes::Bytes;

pub use error::Error;
pub use supported::Supported;

use super::TryFromPrimitiveError;
use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::request::CqlRequestSerializationError;

/// Opcodes of the responses this crate understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResponseOpcode {
    /// `ERROR`
    Error = 0x00,
    /// `READY`
    Ready = 0x02,
    /// `AUTHENTICATE`
    Authenticate = 0x03,
    /// `SUPPORTED`
    Supported = 0x06,
    /// `RESULT`
    Result = 0x08,
    /// `EVENT`
    Event = 0x0C,
    /// `AUTH_CHALLENGE`
    AuthChallenge = 0x0E,
    /// `AUTH_SUCCESS`
    AuthSuccess = 0x10,
}

const RESPONSE_OPCODES: [(ResponseOpcode, &str); 8] = [
    (ResponseOpcode::Error, "ERROR"),
    (ResponseOpcode::Ready, "READY"),
    (ResponseOpcode::Authenticate, "AUTHENTICATE"),
    (ResponseOpcode::Supported, "SUPPORTED"),
    (ResponseOpcode::Result, "RESULT"),
    (ResponseOpcode::Event, "EVENT"),
    (ResponseOpcode::AuthChallenge, "AUTH_CHALLENGE"),
    (ResponseOpcode::AuthSuccess, "AUTH_SUCCESS"),
];

impl ResponseOpcode {
    /// Name of the opcode in the protocol description.
    pub fn as_str(self) -> &'static str {
        RESPONSE_OPCODES
            .iter()
            .find(|(opcode, _)| *opcode == self)
            .map_or("?", |(_, name)| *name)
    }
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        RESPONSE_OPCODES
            .iter()
            .map(|(opcode, _)| *opcode)
            .find(|opcode| *opcode as u8 == value)
            .ok_or(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            })
    }
}

impl std::fmt::Display for ResponseOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed response body of any kind.
#[derive(Debug, Clone)]
pub enum Response {
    /// The request failed.
    Error(Error),
    /// The connection is ready after `STARTUP`.
    Ready,
    /// Outcome of `QUERY`, `EXECUTE` or `PREPARE`.
    Result(result::Result),
    /// The server requires authentication.
    Authenticate(authenticate::Authenticate),
    /// Authentication finished.
    AuthSuccess(authenticate::AuthSuccess),
    /// Another authentication round is needed.
    AuthChallenge(authenticate::AuthChallenge),
    /// Answer to `OPTIONS`.
    Supported(Supported),
    /// Pushed by the server on stream -1.
    Event(event::Event),
}

impl Response {
    /// Parses a body announced by `opcode`. `cached_metadata` is only
    /// consulted for rows results sent without their own metadata.
    pub fn deserialize(
        opcode: ResponseOpcode,
        body: Bytes,
        cached_metadata: Option<&Arc<result::ResultMetadata>>,
    ) -> Result<Response, CqlResponseParseError> {
        let buf = &mut &body[..];
        Ok(match opcode {
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(body.clone(), cached_metadata)?),
            ResponseOpcode::Event => Response::Event(event::Event::deserialize(buf)?),
            ResponseOpcode::Supported => Response::Supported(
                Supported::deserialize(buf).map_err(CqlResponseParseError::CqlSupportedParseError)?,
            ),
            ResponseOpcode::Authenticate => Response::Authenticate(
                authenticate::Authenticate::deserialize(buf).map_err(CqlResponseParseError::CqlAuthenticateParseError)?,
            ),
            ResponseOpcode::AuthChallenge => Response::AuthChallenge(
                authenticate::AuthChallenge::deserialize(buf).map_err(CqlResponseParseError::CqlAuthChallengeParseError)?,
            ),
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(
                authenticate::AuthSuccess::deserialize(buf).map_err(CqlResponseParseError::CqlAuthSuccessParseError)?,
            ),
        })
    }

    /// Opcode a frame carrying this body is sent with.
    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
            Response::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Event(_) => ResponseOpcode::Event,
        }
    }

    /// Writes the body the way a server would.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        match self {
            Response::Ready => Ok(()),
            Response::Error(body) => body.serialize(buf),
            Response::Result(body) => body.serialize(buf),
            Response::Authenticate(body) => body.serialize(buf),
            Response::AuthSuccess(body) => body.serialize(buf),
            Response::AuthChallenge(body) => body.serialize(buf),
            Response::Supported(body) => body.serialize(buf),
            Response::Event(body) => body.serialize(buf),
        }
    }

    /// Splits an `ERROR` off from every other kind.
    pub fn into_non_error_response(self) -> Result<NonErrorResponse, Error> {
        let response = match self {
            Response::Error(err) => return Err(err),
            Response::Ready => NonErrorResponse::Ready,
            Response::Result(body) => NonErrorResponse::Result(body),
            Response::Authenticate(body) => NonErrorResponse::Authenticate(body),
            Response::AuthSuccess(body) => NonErrorResponse::AuthSuccess(body),
            Response::AuthChallenge(body) => NonErrorResponse::AuthChallenge(body),
            Response::Supported(body) => NonErrorResponse::Supported(body),
            Response::Event(body) => NonErrorResponse::Event(body),
        };
        Ok(response)
    }
}

/// [`Response`] without the `ERROR` case.
#[derive(Debug, Clone)]
pub enum NonErrorResponse {
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl NonErrorResponse {
    /// Opcode name, for "unexpected response" errors.
    pub fn to_response_kind(&self) -> &'static str {
        let opcode = match self {
            NonErrorResponse::Ready => ResponseOpcode::Ready,
            NonErrorResponse::Result(_) => ResponseOpcode::Result,
            NonErrorResponse::Authenticate(_) => ResponseOpcode::Authenticate,
            NonErrorResponse::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
            NonErrorResponse::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            NonErrorResponse::Supported(_) => ResponseOpcode::Supported,
            NonErrorResponse::Event(_) => ResponseOpcode::Event,
        };
        opcode.as_str()
    }
}
