/// Analysis passes for EVM bytecode
use std::collections::HashSet;

use primitive_types::U256;
use revm::Bytecode;

use crate::evm::types::EVMU256;

/// Find all constants in the bytecode by observing PUSH instructions.
///
/// Comparison operands baked into the contract are prime mutation values:
/// a guard like `require(amount > 1e18)` compares against a PUSHed constant,
/// and hitting that exact value (or its neighborhood) steers execution down
/// the guarded path. PUSHes immediately feeding a JUMPI are skipped, those
/// are jump destinations rather than data.
pub fn find_constants(bytecode: &Bytecode) -> HashSet<Vec<u8>> {
    let mut idx = 0;
    let bytes = bytecode.bytes();
    let bytecode_len = bytes.len();
    let mut constants = HashSet::new();
    while idx < bytecode_len {
        let op = bytes[idx];
        if !(0x60..=0x7f).contains(&op) {
            idx += 1;
            continue;
        }
        let push_len = (op - 0x5f) as usize;
        if idx + push_len + 1 > bytecode_len {
            // ran into trailing padding / metadata
            break;
        }
        let next_op = bytes.get(idx + push_len + 1).copied();
        let feeds_jumpi = matches!(next_op, Some(0x56) | Some(0x57));
        if !feeds_jumpi && push_len >= 2 {
            constants.insert(bytes[idx + 1..idx + 1 + push_len].to_vec());
        }
        idx += push_len + 1;
    }
    constants
}

/// Contract constants as 256-bit words, largest-first so value-like
/// constants come before enum discriminants and offsets.
pub fn constant_words(bytecode: &Bytecode) -> Vec<EVMU256> {
    let mut words: Vec<EVMU256> = find_constants(bytecode)
        .into_iter()
        .map(|c| U256::from_big_endian(&c))
        .filter(|w| !w.is_zero())
        .collect();
    words.sort_unstable_by(|a, b| b.cmp(a));
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn code(hex_str: &str) -> Bytecode {
        Bytecode::new_raw(Bytes::from(hex::decode(hex_str).unwrap()))
    }

    #[test]
    fn push_operands_are_collected() {
        // PUSH20 <addr>, ADDRESS, EQ, PUSH1 0x80, PUSH1 0x40, MSTORE
        let bytecode = code(
            "73ccef237d1d745fba9114a4c8c7c1effb9edc87d8301460806040526000",
        );
        let constants = find_constants(&bytecode);
        assert!(constants
            .iter()
            .any(|c| c.len() == 20 && c[0] == 0xcc && c[19] == 0xd8));
        // single-byte pushes are noise and stay out
        assert!(constants.iter().all(|c| c.len() >= 2));
    }

    #[test]
    fn jumpi_destinations_are_skipped() {
        // PUSH2 0x0102, JUMPI vs PUSH2 0x0304, STOP
        let bytecode = code("610102576103040000");
        let constants = find_constants(&bytecode);
        assert!(!constants.contains(&vec![0x01, 0x02]));
        assert!(constants.contains(&vec![0x03, 0x04]));
    }

    #[test]
    fn truncated_push_ends_scan() {
        // PUSH32 with only 4 bytes of operand left
        let bytecode = code("7fdeadbeef");
        assert!(find_constants(&bytecode).is_empty());
    }

    #[test]
    fn constant_words_are_sorted_desc() {
        let bytecode = code("6101026202030400"); // PUSH2 0x0102, PUSH3 0x020304, STOP
        let words = constant_words(&bytecode);
        assert_eq!(words.len(), 2);
        assert!(words[0] > words[1]);
    }
}
