//! Control-frame payloads of the key request/serve protocol
//!
//! Request: `REQ_KEY[:requester[:peer[:size]]]`
//! Reply:   `KEY:<bits>` or `ERR:NO_KEY_AVAILABLE`

use std::fmt;
use crate::custodian::{KEYLEN_PREFIX, KEY_PREFIX};
use crate::{QkdNetError, Result};

pub const REQ_KEY: &str = "REQ_KEY";
pub const NO_KEY_AVAILABLE: &str = "ERR:NO_KEY_AVAILABLE";

/// True when `payload` looks like a key push or key reply. Such payloads
/// seen by the controller are reflections of its own replies.
pub fn is_push_command(payload: &str) -> bool {
    payload.starts_with(KEY_PREFIX) || payload.starts_with(KEYLEN_PREFIX)
}

/// A station's key request. The fields are informational; serving does not
/// depend on them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRequest {
    pub requester: Option<String>,
    pub peer: Option<String>,
    pub size: Option<usize>,
}

impl KeyRequest {
    pub fn new(requester: &str, peer: &str, size: usize) -> Self {
        Self {
            requester: Some(requester.to_string()),
            peer: Some(peer.to_string()),
            size: Some(size),
        }
    }

    /// Parse a request payload; `None` if it is not a request at all
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.split(':');
        if parts.next() != Some(REQ_KEY) {
            return None;
        }
        let requester = parts.next().map(str::to_string);
        let peer = parts.next().map(str::to_string);
        let size = parts.next().and_then(|s| s.parse().ok());
        Some(Self { requester, peer, size })
    }
}

impl fmt::Display for KeyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REQ_KEY)?;
        let fields = [
            self.requester.clone(),
            self.peer.clone(),
            self.size.map(|s| s.to_string()),
        ];
        for field in fields.iter().map_while(|field| field.as_ref()) {
            write!(f, ":{}", field)?;
        }
        Ok(())
    }
}

/// The controller's answer to a [`KeyRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReply {
    Key(String),
    NoKeyAvailable,
}

impl KeyReply {
    pub fn parse(payload: &str) -> Result<Self> {
        if let Some(bits) = payload.strip_prefix(KEY_PREFIX) {
            return Ok(KeyReply::Key(bits.to_string()));
        }
        if payload == NO_KEY_AVAILABLE {
            return Ok(KeyReply::NoKeyAvailable);
        }
        Err(QkdNetError::Protocol(format!("unexpected key reply {:?}", payload)))
    }
}

impl fmt::Display for KeyReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyReply::Key(bits) => write!(f, "{}{}", KEY_PREFIX, bits),
            KeyReply::NoKeyAvailable => f.write_str(NO_KEY_AVAILABLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_forms() {
        let req = KeyRequest::new("ogs1", "ogs2", 16);
        assert_eq!(req.to_string(), "REQ_KEY:ogs1:ogs2:16");
        assert_eq!(KeyRequest::parse("REQ_KEY:ogs1:ogs2:16"), Some(req));

        let bare = KeyRequest::parse("REQ_KEY").unwrap();
        assert_eq!(bare, KeyRequest::default());
        assert_eq!(bare.to_string(), "REQ_KEY");

        let partial = KeyRequest::parse("REQ_KEY:ogs1").unwrap();
        assert_eq!(partial.requester.as_deref(), Some("ogs1"));
        assert_eq!(partial.peer, None);
    }

    #[test]
    fn test_non_requests() {
        assert_eq!(KeyRequest::parse("REQ_KEYS:x"), None);
        assert_eq!(KeyRequest::parse("KEY:0101"), None);
        assert_eq!(KeyRequest::parse(""), None);
    }

    #[test]
    fn test_reply_forms() {
        assert_eq!(KeyReply::Key("1100".into()).to_string(), "KEY:1100");
        assert_eq!(KeyReply::parse("KEY:1100").unwrap(), KeyReply::Key("1100".into()));
        assert_eq!(KeyReply::parse("ERR:NO_KEY_AVAILABLE").unwrap(), KeyReply::NoKeyAvailable);
        assert!(KeyReply::parse("ERR:SOMETHING").is_err());
    }

    #[test]
    fn test_push_command_detection() {
        assert!(is_push_command("KEY:0101"));
        assert!(is_push_command("KEYLEN:3:101"));
        assert!(!is_push_command("REQ_KEY:a:b:1"));
        assert!(!is_push_command("ERR:NO_KEY_AVAILABLE"));
    }
}
