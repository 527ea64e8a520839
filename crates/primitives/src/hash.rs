use fluxd_consensus::Hash256;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), the digest behind key and script identifiers.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha256(data)));
    out
}

/// Hex of a 256-bit hash in the byte-reversed order used for display.
pub fn hash256_to_display_hex(hash: &Hash256) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn hash256_from_display_hex(input: &str) -> Option<Hash256> {
    let bytes = input.trim().as_bytes();
    if bytes.len() != 64 {
        return None;
    }
    let nibble = |b: u8| -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    };
    let mut out = [0u8; 32];
    for (idx, pair) in bytes.chunks(2).enumerate() {
        out[31 - idx] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hex_is_byte_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        hash[31] = 0xfe;
        let text = hash256_to_display_hex(&hash);
        assert!(text.starts_with("fe"));
        assert!(text.ends_with("01"));
        assert_eq!(hash256_from_display_hex(&text), Some(hash));
        assert_eq!(hash256_from_display_hex("zz"), None);
    }
}
