//! Classical-channel messages of the key agreement handshake
//!
//! Every handshake message names the attempt it belongs to as
//! `<seq>.<attempt>`: the key position and the try at that position. The
//! textual forms are direction dependent: `<id>:1` is a diagonal-basis
//! announcement when sent by the responder and a mismatch notice when sent by
//! the initiator. Each role therefore parses with its own constructor.

use std::fmt;
use std::str::FromStr;
use crate::codec::Bit;
use crate::qkd::Basis;
use crate::{QkdNetError, Result};

/// Sequence tag reserved for the post-agreement encrypted payload
const ENCRYPTED_TAG: &str = "-1";

/// One attempt at one key position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId {
    pub seq: u64,
    /// 1-based try counter within `seq`
    pub attempt: u32,
}

impl AttemptId {
    pub fn new(seq: u64, attempt: u32) -> Self {
        Self { seq, attempt }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seq, self.attempt)
    }
}

impl FromStr for AttemptId {
    type Err = QkdNetError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || QkdNetError::Protocol(format!("bad attempt id {:?}", s));
        let (seq, attempt) = s.split_once('.').ok_or_else(bad)?;
        Ok(Self {
            seq: seq.parse().map_err(|_| bad())?,
            attempt: attempt.parse().map_err(|_| bad())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Responder -> initiator: `<id>:<basis>`
    Announce { id: AttemptId, basis: Basis },
    /// Initiator -> responder: `<id>:0:<bit>`, or `<id>:0` without disclosure
    Match { id: AttemptId, bit: Option<Bit> },
    /// Initiator -> responder: `<id>:1`
    Mismatch { id: AttemptId },
    /// Initiator -> responder: `-1:<ciphertext>`
    Encrypted(String),
}

impl HandshakeMessage {
    /// Parse a message arriving at the initiator
    pub fn parse_announcement(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [id, basis] => {
                let id = id.parse()?;
                let basis = Basis::from_digit(basis)
                    .ok_or_else(|| QkdNetError::Protocol(format!("bad basis in {:?}", text)))?;
                Ok(HandshakeMessage::Announce { id, basis })
            }
            _ => Err(QkdNetError::Protocol(format!("unexpected announcement {:?}", text))),
        }
    }

    /// Parse a message arriving at the responder
    pub fn parse_confirmation(text: &str) -> Result<Self> {
        if let Some(ciphertext) = text.strip_prefix("-1:") {
            return Ok(HandshakeMessage::Encrypted(ciphertext.to_string()));
        }

        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [id, "0"] => Ok(HandshakeMessage::Match { id: id.parse()?, bit: None }),
            [id, "0", bit] => {
                let bit = match *bit {
                    "0" => false,
                    "1" => true,
                    _ => return Err(QkdNetError::Protocol(format!("bad disclosed bit in {:?}", text))),
                };
                Ok(HandshakeMessage::Match { id: id.parse()?, bit: Some(bit) })
            }
            [id, "1"] => Ok(HandshakeMessage::Mismatch { id: id.parse()? }),
            _ => Err(QkdNetError::Protocol(format!("unexpected confirmation {:?}", text))),
        }
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeMessage::Announce { id, basis } => write!(f, "{}:{}", id, basis),
            HandshakeMessage::Match { id, bit: Some(bit) } => write!(f, "{}:0:{}", id, u8::from(*bit)),
            HandshakeMessage::Match { id, bit: None } => write!(f, "{}:0", id),
            HandshakeMessage::Mismatch { id } => write!(f, "{}:1", id),
            HandshakeMessage::Encrypted(ciphertext) => write!(f, "{}:{}", ENCRYPTED_TAG, ciphertext),
        }
    }
}
