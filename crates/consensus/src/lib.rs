//! Network parameters and node policy defaults.

pub mod params;
pub mod policy;

pub use params::{chain_params, ChainParams, Network};
pub use policy::Policy;

/// 32-byte content hash. Used for block ids, transaction ids, nullifiers,
/// output commitments, and txo accumulator roots.
pub type Hash256 = [u8; 32];

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push(char::from_digit((byte >> 4) as u32, 16).expect("hex digit"));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).expect("hex digit"));
    }
    out
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string must be 64 characters"),
            HexError::InvalidHex => write!(f, "invalid hex character"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[31] = 0x01;
        let hex = hash256_to_hex(&hash);
        assert_eq!(hex.len(), 64);
        assert_eq!(hash256_from_hex(&hex).expect("decode"), hash);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(
            hash256_from_hex("abcd"),
            Err(HexError::InvalidLength)
        ));
        let bad = "zz".repeat(32);
        assert!(matches!(hash256_from_hex(&bad), Err(HexError::InvalidHex)));
    }
}
