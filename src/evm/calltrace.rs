/// Call-tree extraction: walk the `callTracer` output of a transaction and
/// pull out every first call into a protected contract.
use std::collections::HashSet;
use std::str::FromStr;

use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ReplayError, Result};
use crate::evm::onchain::endpoints::NodeClient;
use crate::evm::types::{parse_hex_bytes, parse_hex_u256, EVMAddress};

/// One frame of the call tree as reported by the call-style tracer. Frames
/// are value types; no parent pointers, so the tree stays acyclic by
/// construction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub call_type: String,
    pub from: String,
    pub to: String,
    pub input: String,
    pub gas: String,
    pub gas_used: String,
    pub value: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub calls: Vec<CallFrame>,
}

/// A sub-call into a protected contract, lifted out of the tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedCall {
    pub contract_address: EVMAddress,
    pub from: EVMAddress,
    pub input_data: Vec<u8>,
    pub call_type: String,
    pub value: U256,
    pub gas: u64,
    pub depth: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallTrace {
    pub original_tx_hash: H256,
    pub root: CallFrame,
    pub extracted: Vec<ExtractedCall>,
    pub protected: HashSet<EVMAddress>,
}

impl CallTrace {
    pub fn has_extractions(&self) -> bool {
        !self.extracted.is_empty()
    }

    /// The first extracted call targeting `contract`, if any.
    pub fn extraction_for(&self, contract: EVMAddress) -> Option<&ExtractedCall> {
        self.extracted
            .iter()
            .find(|e| e.contract_address == contract)
    }
}

fn parse_address(s: &str) -> Option<EVMAddress> {
    H160::from_str(s).ok()
}

fn input_is_meaningful(input: &str) -> bool {
    !input.is_empty() && input != "0x"
}

/// Pre-order walk. A frame whose `to` is protected and whose input carries
/// data is extracted, and the walk does not descend into it: only the first
/// match along each root-to-leaf path is recorded.
fn extract_frames(
    frame: &CallFrame,
    protected: &HashSet<EVMAddress>,
    depth: usize,
    out: &mut Vec<ExtractedCall>,
) {
    if let Some(to) = parse_address(&frame.to) {
        if protected.contains(&to) && input_is_meaningful(&frame.input) {
            out.push(ExtractedCall {
                contract_address: to,
                from: parse_address(&frame.from).unwrap_or_default(),
                input_data: parse_hex_bytes(&frame.input),
                call_type: frame.call_type.clone(),
                value: parse_hex_u256(&frame.value),
                gas: parse_hex_u256(&frame.gas).low_u64(),
                depth,
            });
            return;
        }
    }
    for child in &frame.calls {
        extract_frames(child, protected, depth + 1, out);
    }
}

pub struct CallTraceExtractor<'a> {
    client: &'a NodeClient,
}

impl<'a> CallTraceExtractor<'a> {
    pub fn new(client: &'a NodeClient) -> Self {
        Self { client }
    }

    pub fn extract(
        &self,
        tx_hash: H256,
        protected: HashSet<EVMAddress>,
    ) -> Result<CallTrace> {
        let raw = self.client.trace_call_tree(tx_hash)?;
        let root: CallFrame = serde_json::from_value(raw).map_err(|e| {
            ReplayError::parsing(format!("callTracer frame did not parse: {}", e))
                .with_context("tx", format!("{:?}", tx_hash))
        })?;
        Ok(build_call_trace(tx_hash, root, protected))
    }
}

/// Assemble a [`CallTrace`] from an already-fetched frame tree.
pub fn build_call_trace(
    tx_hash: H256,
    root: CallFrame,
    protected: HashSet<EVMAddress>,
) -> CallTrace {
    let mut extracted = vec![];
    extract_frames(&root, &protected, 0, &mut extracted);
    debug!(
        "call trace for {:?}: {} protected sub-calls",
        tx_hash,
        extracted.len()
    );
    CallTrace {
        original_tx_hash: tx_hash,
        root,
        extracted,
        protected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::fixed_address;

    fn frame(to: &str, input: &str, calls: Vec<CallFrame>) -> CallFrame {
        CallFrame {
            call_type: "CALL".to_string(),
            from: "0x00000000000000000000000000000000000000aa".to_string(),
            to: to.to_string(),
            input: input.to_string(),
            gas: "0x5208".to_string(),
            gas_used: "0x5208".to_string(),
            value: "0x0".to_string(),
            output: None,
            error: None,
            calls,
        }
    }

    const PROTECTED: &str = "0x1111111111111111111111111111111111111111";

    fn protected_set() -> HashSet<EVMAddress> {
        let mut s = HashSet::new();
        s.insert(fixed_address("1111111111111111111111111111111111111111"));
        s
    }

    #[test]
    fn first_match_stops_descent() {
        // root -> protected -> protected: only the outer call is extracted
        let inner = frame(PROTECTED, "0xdeadbeef", vec![]);
        let outer = frame(PROTECTED, "0xcafebabe", vec![inner]);
        let root = frame("0x2222222222222222222222222222222222222222", "0x01", vec![outer]);
        let trace = build_call_trace(H256::zero(), root, protected_set());
        assert_eq!(trace.extracted.len(), 1);
        assert_eq!(trace.extracted[0].input_data, vec![0xca, 0xfe, 0xba, 0xbe]);
        assert_eq!(trace.extracted[0].depth, 1);
    }

    #[test]
    fn empty_input_frames_are_skipped() {
        let empty = frame(PROTECTED, "0x", vec![frame(PROTECTED, "0x02", vec![])]);
        let root = frame("0x3333333333333333333333333333333333333333", "0x01", vec![empty]);
        let trace = build_call_trace(H256::zero(), root, protected_set());
        // the empty-input frame is not extracted, but its child is
        assert_eq!(trace.extracted.len(), 1);
        assert_eq!(trace.extracted[0].input_data, vec![0x02]);
        assert_eq!(trace.extracted[0].depth, 2);
    }

    #[test]
    fn sibling_branches_both_extract() {
        let a = frame(PROTECTED, "0xaa", vec![]);
        let b = frame(PROTECTED, "0xbb", vec![]);
        let root = frame("0x4444444444444444444444444444444444444444", "0x01", vec![a, b]);
        let trace = build_call_trace(H256::zero(), root, protected_set());
        assert_eq!(trace.extracted.len(), 2);
        for e in &trace.extracted {
            assert!(trace.protected.contains(&e.contract_address));
            assert!(!e.input_data.is_empty());
        }
    }

    #[test]
    fn malformed_numbers_default_to_zero() {
        let mut f = frame(PROTECTED, "0x1234", vec![]);
        f.value = "not-hex".to_string();
        f.gas = "".to_string();
        let trace = build_call_trace(H256::zero(), f, protected_set());
        assert_eq!(trace.extracted[0].value, U256::zero());
        assert_eq!(trace.extracted[0].gas, 0);
    }

    #[test]
    fn calltracer_json_parses() {
        let raw = r#"{
            "type": "CALL",
            "from": "0x00000000000000000000000000000000000000aa",
            "to": "0x1111111111111111111111111111111111111111",
            "input": "0x698ccd3a",
            "gas": "0x100000",
            "gasUsed": "0x5208",
            "value": "0x0",
            "calls": [
                {"type": "STATICCALL",
                 "from": "0x1111111111111111111111111111111111111111",
                 "to": "0x2222222222222222222222222222222222222222",
                 "input": "0x", "gas": "0x1000", "gasUsed": "0x10", "value": "0x0"}
            ]
        }"#;
        let root: CallFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(root.calls.len(), 1);
        assert_eq!(root.calls[0].call_type, "STATICCALL");
        let trace = build_call_trace(H256::zero(), root, protected_set());
        assert_eq!(trace.extracted.len(), 1);
        assert_eq!(trace.extracted[0].input_data, vec![0x69, 0x8c, 0xcd, 0x3a]);
    }
}
