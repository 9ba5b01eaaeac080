//! Wire protocol shared by both channels.
//!
//! Every message travels as one line of JSON holding an array of strings. A
//! registration request is a single part (`["STOP"]` or `["<identity>"]`), a
//! submission is three parts (`["hello", "<identity>", "<token>"]`), and every
//! reply is a single part. Requests are decoded into typed values here, once,
//! so handlers never compare raw strings.

use std::{fmt, io, str::FromStr};

use hex::FromHex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest line, newline included, a peer may send before it is cut off.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub const STOP_COMMAND: &str = "STOP";
pub const STOP_ACK: &str = "STOP:ACK";
pub const ACK: &str = "ACK";
pub const UNKNOWN_CLIENT: &str = "ERR:unknown-client";
pub const WRONG_TOKEN: &str = "ERR:wrong-token";
pub const STORAGE_FAILURE: &str = "ERR:storage";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected {expected} message parts, got {actual}")]
    PartCount { expected: usize, actual: usize },

    #[error("'{0}' is not a valid client identity")]
    InvalidIdentity(String),

    #[error("'{0}' is not a valid token")]
    InvalidToken(String),

    #[error("unrecognized reply '{0}'")]
    UnknownReply(String),
}

/// One atomic multi-part message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame {
    parts: Vec<String>,
}

impl Frame {
    pub fn new(parts: Vec<String>) -> Self {
        Self { parts }
    }

    pub fn single(part: impl Into<String>) -> Self {
        Self {
            parts: vec![part.into()],
        }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Returns the only part of a single-part frame.
    pub fn single_part(&self) -> Result<&str, ProtocolError> {
        match self.parts.as_slice() {
            [part] => Ok(part.as_str()),
            parts => Err(ProtocolError::PartCount {
                expected: 1,
                actual: parts.len(),
            }),
        }
    }
}

pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_line(&mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_LEN} bytes"),
            ));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Writes one frame and flushes, so a reply is on the wire when this returns.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Client-generated identity; a UUID rendered as 32 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdentity(Uuid);

impl ClientIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ClientIdentity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidIdentity(s.to_string()))
    }
}

/// Server-issued credential: 128 random bits, lowercase hex on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; 16]);

impl Token {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Token {
    type Err = ProtocolError;

    /// Tokens are compared as issued, so only the lowercase spelling is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(ProtocolError::InvalidToken(s.to_string()));
        }
        <[u8; 16]>::from_hex(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidToken(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    Register(ClientIdentity),
    Stop,
}

impl RegistrationRequest {
    /// `STOP` is matched exactly; anything else must parse as an identity.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let part = frame.single_part()?;
        if part == STOP_COMMAND {
            return Ok(RegistrationRequest::Stop);
        }
        part.parse().map(RegistrationRequest::Register)
    }

    pub fn encode(&self) -> Frame {
        match self {
            RegistrationRequest::Register(identity) => Frame::single(identity.to_string()),
            RegistrationRequest::Stop => Frame::single(STOP_COMMAND),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationReply {
    Token(Token),
    StopAck,
    UnknownClient,
}

impl RegistrationReply {
    pub fn encode(&self) -> Frame {
        match self {
            RegistrationReply::Token(token) => Frame::single(token.to_string()),
            RegistrationReply::StopAck => Frame::single(STOP_ACK),
            RegistrationReply::UnknownClient => Frame::single(UNKNOWN_CLIENT),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.single_part()? {
            STOP_ACK => Ok(RegistrationReply::StopAck),
            UNKNOWN_CLIENT => Ok(RegistrationReply::UnknownClient),
            other => other
                .parse()
                .map(RegistrationReply::Token)
                .map_err(|_| ProtocolError::UnknownReply(other.to_string())),
        }
    }
}

/// Raw submission parts. Identity and token are decoded by the handler so a
/// malformed value maps onto the regular rejection replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub payload: String,
    pub identity: String,
    pub token: String,
}

impl SubmissionRequest {
    pub fn new(payload: impl Into<String>, identity: &ClientIdentity, token: &Token) -> Self {
        Self {
            payload: payload.into(),
            identity: identity.to_string(),
            token: token.to_string(),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.parts() {
            [payload, identity, token] => Ok(Self {
                payload: payload.clone(),
                identity: identity.clone(),
                token: token.clone(),
            }),
            parts => Err(ProtocolError::PartCount {
                expected: 3,
                actual: parts.len(),
            }),
        }
    }

    pub fn encode(&self) -> Frame {
        Frame::new(vec![
            self.payload.clone(),
            self.identity.clone(),
            self.token.clone(),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionReply {
    Ack,
    UnknownClient,
    WrongToken,
    StorageFailure,
}

impl SubmissionReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionReply::Ack => ACK,
            SubmissionReply::UnknownClient => UNKNOWN_CLIENT,
            SubmissionReply::WrongToken => WRONG_TOKEN,
            SubmissionReply::StorageFailure => STORAGE_FAILURE,
        }
    }

    pub fn encode(&self) -> Frame {
        Frame::single(self.as_str())
    }

    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.single_part()? {
            ACK => Ok(SubmissionReply::Ack),
            UNKNOWN_CLIENT => Ok(SubmissionReply::UnknownClient),
            WRONG_TOKEN => Ok(SubmissionReply::WrongToken),
            STORAGE_FAILURE => Ok(SubmissionReply::StorageFailure),
            other => Err(ProtocolError::UnknownReply(other.to_string())),
        }
    }
}

impl fmt::Display for SubmissionReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
