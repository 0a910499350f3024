//! Bit codec: converts key material between bit sequences, the packed form
//! (8 bits per character) and the canonical `0`/`1` bitstring.
//!
//! A packed unit is a character in `U+0000..=U+00FF` whose code is the
//! big-endian value of its 8 bits. On the wire the packed form travels as
//! UTF-8, so units above 0x7F occupy two bytes.

use std::fmt;

/// A single key bit.
pub type Bit = bool;

/// Bits per packed unit
pub const UNIT_BITS: usize = 8;

/// Key material in packed form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackedKey(String);

impl PackedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of packed units (characters), not bytes
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unit codes in order
    pub fn codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.chars().map(|c| c as u32)
    }
}

impl fmt::Display for PackedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pack bits left to right into 8-bit units, zero-padding the last unit on
/// the right.
pub fn pack(bits: &[Bit]) -> PackedKey {
    let packed = bits
        .chunks(UNIT_BITS)
        .map(|chunk| {
            let mut value = 0u8;
            for (i, &bit) in chunk.iter().enumerate() {
                if bit {
                    value |= 0x80 >> i;
                }
            }
            char::from(value)
        })
        .collect();
    PackedKey(packed)
}

/// Pack `bits`, then repeat the packed units and truncate to exactly
/// `length` units. Used to stretch a short key over a longer message.
pub fn expand_to_length(bits: &[Bit], length: usize) -> PackedKey {
    let packed = pack(bits);
    if packed.is_empty() {
        return packed;
    }
    PackedKey(packed.as_str().chars().cycle().take(length).collect())
}

/// Expand each packed unit to its 8-digit binary form.
///
/// Lossy for keys whose length was not a multiple of 8: the pad bits come
/// back as trailing zeros, so callers needing the exact length must carry it
/// separately.
pub fn to_canonical_bits(packed: &str) -> String {
    packed
        .chars()
        .map(|c| format!("{:08b}", c as u32))
        .collect()
}

/// Render bits as a canonical `0`/`1` string
pub fn to_bitstring(bits: &[Bit]) -> String {
    bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
}

/// True when `s` is non-empty and consists only of `0` and `1`.
pub fn is_canonical(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b == b'0' || b == b'1')
}

/// Parse a canonical bitstring back into bits.
pub fn parse_bitstring(s: &str) -> Option<Vec<Bit>> {
    if s.is_empty() {
        return Some(Vec::new());
    }
    if !is_canonical(s) {
        return None;
    }
    Some(s.bytes().map(|b| b == b'1').collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(s: &str) -> Vec<Bit> {
        parse_bitstring(s).unwrap()
    }

    #[test]
    fn test_pack_single_unit() {
        let packed = pack(&bits("10101010"));
        assert_eq!(packed.len(), 1);
        assert_eq!(packed.codes().collect::<Vec<_>>(), vec![0xAA]);
    }

    #[test]
    fn test_pack_pads_final_unit_on_the_right() {
        let packed = pack(&bits("1111111111"));
        assert_eq!(packed.codes().collect::<Vec<_>>(), vec![0xFF, 0xC0]);
        assert_eq!(to_canonical_bits(packed.as_str()), "1111111111000000");
    }

    #[test]
    fn test_canonical_roundtrip_recovers_prefix() {
        for input in ["1", "0110", "1100101", "101100111000111101"] {
            let original = bits(input);
            let expanded = to_canonical_bits(pack(&original).as_str());

            assert_eq!(expanded.len() % UNIT_BITS, 0);
            assert!(expanded[input.len()..].bytes().all(|b| b == b'0'));
            assert_eq!(&expanded[..input.len()], input);
        }
    }

    #[test]
    fn test_expand_to_length_repeats_and_truncates() {
        let key = bits("0100000101000010"); // "AB"
        assert_eq!(expand_to_length(&key, 5).as_str(), "ABABA");
        assert_eq!(expand_to_length(&key, 1).as_str(), "A");
        assert_eq!(expand_to_length(&key, 0).as_str(), "");
    }

    #[test]
    fn test_empty_inputs() {
        assert!(pack(&[]).is_empty());
        assert!(expand_to_length(&[], 10).is_empty());
        assert_eq!(to_canonical_bits(""), "");
        assert_eq!(to_bitstring(&[]), "");
    }

    #[test]
    fn test_is_canonical() {
        assert!(is_canonical("0101"));
        assert!(!is_canonical(""));
        assert!(!is_canonical("01a1"));
        assert!(parse_bitstring("012").is_none());
    }
}
