//! Link-layer frames
//!
//! Ethernet II framing: dst(6) + src(6) + ethertype(2) followed by the
//! payload. Key-protocol control frames use a dedicated ethertype and carry
//! short ASCII payloads (`REQ_KEY:...`, `KEY:<bits>`, `ERR:...`).

use std::fmt;
use std::str::FromStr;
use crate::{QkdNetError, Result};

/// Ethernet header length on the wire
pub const ETH_HDR_LEN: usize = 14;

pub mod ethertype {
    /// IEEE 802.1 local experimental, used for key-protocol control frames
    pub const CONTROL: u16 = 0x88B5;
    pub const ARP: u16 = 0x0806;
    pub const IPV4: u16 = 0x0800;
}

/// 48-bit MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (broadcast included)
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddr {
    type Err = QkdNetError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| QkdNetError::Protocol(format!("short MAC address {:?}", s)))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| QkdNetError::Protocol(format!("bad MAC address {:?}", s)))?;
        }
        if parts.next().is_some() {
            return Err(QkdNetError::Protocol(format!("long MAC address {:?}", s)));
        }
        Ok(MacAddr(octets))
    }
}

/// An Ethernet II frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16, payload: Vec<u8>) -> Self {
        Self { dst, src, ethertype, payload }
    }

    /// Control frame carrying a textual payload
    pub fn control(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &str) -> Self {
        Self::new(dst, src, ethertype, payload.as_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HDR_LEN + self.payload.len());
        frame.extend_from_slice(&self.dst.0);
        frame.extend_from_slice(&self.src.0);
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < ETH_HDR_LEN {
            return Err(QkdNetError::Protocol(format!("runt frame ({} bytes)", raw.len())));
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&raw[0..6]);
        src.copy_from_slice(&raw[6..12]);
        let ethertype = u16::from_be_bytes([raw[12], raw[13]]);
        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype,
            payload: raw[ETH_HDR_LEN..].to_vec(),
        })
    }

    /// Payload as trimmed text; invalid UTF-8 is replaced, and NUL padding
    /// added by short-frame minimums is dropped
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string()
    }
}
