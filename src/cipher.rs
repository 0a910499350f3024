//! Repeating-key XOR stream cipher.
//!
//! Confidentiality demo only: there is no integrity check, and keys shorter
//! than the message repeat once stretched with [`expand_to_length`].

use crate::codec::{expand_to_length, Bit};
use crate::{QkdNetError, Result};

/// XOR each key character code with the matching text character code.
///
/// Output length is the shorter of the two inputs. Applying it twice with the
/// same key returns the original text.
pub fn transform(key: &str, text: &str) -> Result<String> {
    key.chars()
        .zip(text.chars())
        .map(|(k, c)| {
            let code = k as u32 ^ c as u32;
            char::from_u32(code).ok_or_else(|| {
                QkdNetError::Cipher(format!("XOR produced invalid character code {:#x}", code))
            })
        })
        .collect()
}

/// Encrypt `message` under the key bits stretched to the message length.
pub fn seal(key_bits: &[Bit], message: &str) -> Result<String> {
    let key = expand_to_length(key_bits, message.chars().count());
    if key.len() < message.chars().count() {
        return Err(QkdNetError::Cipher("empty key cannot cover message".into()));
    }
    transform(key.as_str(), message)
}

/// Inverse of [`seal`].
pub fn open(key_bits: &[Bit], ciphertext: &str) -> Result<String> {
    seal(key_bits, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_bitstring;

    #[test]
    fn test_transform_is_involution() {
        let key = expand_to_length(&parse_bitstring("1011001110001111").unwrap(), 22);
        let msg = "Hi Eve, how are you???";

        let sealed = transform(key.as_str(), msg).unwrap();
        assert_ne!(sealed, msg);
        assert_eq!(transform(key.as_str(), &sealed).unwrap(), msg);
    }

    #[test]
    fn test_transform_stops_at_shorter_input() {
        assert_eq!(transform("\u{1}\u{1}", "abcd").unwrap(), "`c");
    }

    #[test]
    fn test_seal_open_with_short_key() {
        let bits = parse_bitstring("110").unwrap();
        let sealed = seal(&bits, "a longer message than the key").unwrap();
        assert_eq!(open(&bits, &sealed).unwrap(), "a longer message than the key");
    }

    #[test]
    fn test_seal_rejects_empty_key() {
        assert!(seal(&[], "text").is_err());
        assert_eq!(seal(&[], "").unwrap(), "");
    }
}
