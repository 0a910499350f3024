//! Key custodian: the controller's single source of truth for the current key
//!
//! The stored key is replaced wholesale on every successful ingest (last
//! writer wins). Readers and the writer go through one `RwLock`, so a serve
//! never observes a half-replaced key.

use std::sync::Arc;
use sha3::{Digest, Sha3_256};
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};
use crate::codec::{is_canonical, to_canonical_bits};
use crate::{QkdNetError, Result};

/// Push command prefixes
pub const KEY_PREFIX: &str = "KEY:";
pub const KEYLEN_PREFIX: &str = "KEYLEN:";

/// The custodian's copy of the current key
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct StoredKey {
    /// Packed form as received, when the push used it
    pub packed: Option<String>,
    /// Canonical `0`/`1` form
    pub bits: String,
    /// Declared bit length
    pub n_bits: usize,
}

impl StoredKey {
    /// Short SHA3-256 fingerprint of the canonical bits, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha3_256::digest(self.bits.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Acknowledgment for a successful ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub n_bits: usize,
}

/// Parse a push payload (`KEY:<payload>` or `KEYLEN:<n>:<payload>`).
///
/// A payload made only of `0`/`1` is taken as canonical bits; anything else
/// is the packed form and is expanded 8 bits per unit. Leading whitespace and
/// trailing line terminators are ignored.
pub fn parse_push_payload(raw: &str) -> Result<StoredKey> {
    let data = raw.trim_start().trim_end_matches(['\r', '\n']);

    if let Some(rest) = data.strip_prefix(KEYLEN_PREFIX) {
        let (len_field, payload) = rest
            .split_once(':')
            .ok_or_else(|| QkdNetError::Format("KEYLEN without payload".into()))?;
        let n_bits: usize = len_field
            .parse()
            .map_err(|_| QkdNetError::Format(format!("bad KEYLEN length {:?}", len_field)))?;

        let (packed, mut bits) = decode_payload(payload)?;
        if n_bits > bits.len() {
            return Err(QkdNetError::Format(format!(
                "KEYLEN {} exceeds the {} bits carried",
                n_bits,
                bits.len()
            )));
        }
        bits.truncate(n_bits);
        return Ok(StoredKey { packed, bits, n_bits });
    }

    if let Some(payload) = data.strip_prefix(KEY_PREFIX) {
        let (packed, bits) = decode_payload(payload)?;
        let n_bits = bits.len();
        return Ok(StoredKey { packed, bits, n_bits });
    }

    Err(QkdNetError::Format("expected KEY: or KEYLEN: command".into()))
}

fn decode_payload(payload: &str) -> Result<(Option<String>, String)> {
    if payload.is_empty() {
        return Err(QkdNetError::Format("empty key payload".into()));
    }
    if is_canonical(payload) {
        return Ok((None, payload.to_string()));
    }
    if let Some(c) = payload.chars().find(|&c| c as u32 > 0xFF) {
        return Err(QkdNetError::Format(format!("packed unit {:?} out of range", c)));
    }
    Ok((Some(payload.to_string()), to_canonical_bits(payload)))
}

/// Process-wide holder of the current key
#[derive(Clone, Default)]
pub struct KeyCustodian {
    current: Arc<RwLock<Option<StoredKey>>>,
}

impl KeyCustodian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `raw` and, on success, replace the stored key.
    ///
    /// A malformed payload leaves the stored key untouched.
    pub async fn ingest(&self, raw: &str) -> Result<AckInfo> {
        let key = parse_push_payload(raw)?;
        let ack = AckInfo { n_bits: key.n_bits };
        log::info!(
            "Stored key: {} bits (packed len={:?}, fingerprint {})",
            key.n_bits,
            key.packed.as_ref().map(|p| p.chars().count()),
            key.fingerprint()
        );

        let mut current = self.current.write().await;
        *current = Some(key);
        Ok(ack)
    }

    /// Snapshot of the current key
    pub async fn read(&self) -> Option<StoredKey> {
        self.current.read().await.clone()
    }

    /// Canonical bits of the current key, if one is held and non-empty
    pub async fn current_bits(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|key| !key.bits.is_empty())
            .map(|key| key.bits.clone())
    }

    pub async fn has_key(&self) -> bool {
        self.current_bits().await.is_some()
    }
}
