/// Common concrete types for the replay EVM
use primitive_types::{H160, H256, U256};

extern crate crypto;

use self::crypto::digest::Digest;
use self::crypto::sha3::Sha3;

pub type EVMAddress = H160;
pub type EVMU256 = U256;

/// Per-contract storage view, slot -> value
pub type StorageMap = std::collections::HashMap<EVMU256, EVMU256>;

/// Keccak-256 of `data` into `out`
pub fn keccak256(data: &[u8], out: &mut [u8; 32]) {
    let mut hasher = Sha3::keccak256();
    hasher.input(data);
    hasher.result(out);
}

/// Keccak-256 of a function signature string, used for selectors
pub fn set_hash(name: &str, out: &mut [u8]) {
    let mut hasher = Sha3::keccak256();
    hasher.input_str(name);
    hasher.result(out)
}

/// First 4 bytes of keccak256(signature)
pub fn selector(signature: &str) -> [u8; 4] {
    let mut hash = [0u8; 32];
    set_hash(signature, &mut hash);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// convert array of 20x u8 to H160
pub fn convert_h160(v: [u8; 20]) -> H160 {
    v.into()
}

/// convert U256 to H160 by taking the last 20 bytes
pub fn convert_u256_to_h160(v: U256) -> H160 {
    let mut temp = H256::zero();
    v.to_big_endian(temp.as_bytes_mut());
    temp.into()
}

/// convert H160 to U256 (zero-extended on the left)
pub fn convert_h160_to_u256(v: H160) -> U256 {
    U256::from_big_endian(v.as_bytes())
}

/// Generate a fixed H160 address from a hex string.
pub fn fixed_address(s: &str) -> H160 {
    let mut address = H160::zero();
    address
        .0
        .copy_from_slice(&hex::decode(s.trim_start_matches("0x")).unwrap());
    address
}

/// Parse a 0x-prefixed hex quantity into U256, zero on malformed input
pub fn parse_hex_u256(s: &str) -> U256 {
    let trimmed = s.trim_start_matches("0x");
    if trimmed.is_empty() {
        return U256::zero();
    }
    U256::from_str_radix(trimmed, 16).unwrap_or_else(|_| U256::zero())
}

/// Parse 0x-prefixed hex bytes, empty vec on malformed input
pub fn parse_hex_bytes(s: &str) -> Vec<u8> {
    let trimmed = s.trim_start_matches("0x");
    if trimmed.len() % 2 != 0 {
        return hex::decode(format!("0{}", trimmed)).unwrap_or_default();
    }
    hex::decode(trimmed).unwrap_or_default()
}

/// 32-byte big-endian rendering of a U256
pub fn u256_to_bytes32(v: &U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    v.to_big_endian(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn selector_matches_known_signature() {
        // transfer(address,uint256) -> a9059cbb
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn address_u256_roundtrip() {
        let addr = H160::from_str("0x1111111111111111111111111111111111111111").unwrap();
        assert_eq!(convert_u256_to_h160(convert_h160_to_u256(addr)), addr);
    }

    #[test]
    fn hex_parsing_tolerates_garbage() {
        assert_eq!(parse_hex_u256("0x2a"), U256::from(42));
        assert_eq!(parse_hex_u256("0x"), U256::zero());
        assert_eq!(parse_hex_u256("zz"), U256::zero());
        assert_eq!(parse_hex_bytes("0x0102"), vec![1, 2]);
        assert!(parse_hex_bytes("0x").is_empty());
    }
}
