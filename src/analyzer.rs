/// Heuristic storage-slot analysis: infer a type, a human description, an
/// importance score and the mutation strategies worth trying per slot.
use itertools::Itertools;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::evm::abi::ContractAbi;
use crate::evm::types::{u256_to_bytes32, EVMAddress, EVMU256, StorageMap};
use crate::r#const::{ARRAY_SLOT_BOUND, SIMPLE_SLOT_BOUND};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    Uint256,
    Address,
    Bool,
    Bytes32,
    String,
    Bytes,
    Mapping,
    Array,
    Struct,
    Empty,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSlotInfo {
    pub slot: EVMU256,
    pub value: EVMU256,
    pub slot_type: SlotType,
    pub description: String,
    pub abi_type: Option<String>,
    pub key_type: Option<String>,
    pub value_type: Option<String>,
    pub mutation_strategies: Vec<String>,
    pub importance_score: f64,
}

impl StorageSlotInfo {
    pub fn is_balance_like(&self) -> bool {
        self.slot_type == SlotType::Uint256 && in_balance_window(&self.value)
    }

    pub fn is_counter_like(&self) -> bool {
        self.slot_type == SlotType::Uint256 && !in_balance_window(&self.value)
    }
}

/// Full analysis surface returned by `AnalyzeContract`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractAnalysis {
    pub address: EVMAddress,
    pub slots: Vec<StorageSlotInfo>,
    pub abi_available: bool,
    pub total_slots: usize,
}

fn in_balance_window(v: &U256) -> bool {
    let lower = U256::exp10(15);
    let upper = U256::exp10(27);
    *v >= lower && *v <= upper
}

fn looks_like_address(bytes: &[u8; 32], value: &U256) -> bool {
    if bytes[..12].iter().any(|b| *b != 0) {
        return false;
    }
    let low_nonzero = bytes[12..].iter().filter(|b| **b != 0).count();
    if low_nonzero == 0 {
        return false;
    }
    low_nonzero >= 4 || *value >= (U256::one() << 32)
}

/// Value-shape inference, first match wins.
fn infer_value_type(value: &U256) -> SlotType {
    if value.is_zero() {
        return SlotType::Empty;
    }
    if *value == U256::one() {
        return SlotType::Bool;
    }
    let bytes = u256_to_bytes32(value);
    if looks_like_address(&bytes, value) {
        return SlotType::Address;
    }
    if *value < U256::from(1_000_000u64) {
        return SlotType::Uint256; // likely counter or flag
    }
    if in_balance_window(value) {
        return SlotType::Uint256; // balance-like magnitude
    }
    SlotType::Bytes32
}

fn nonzero_slot_bytes(slot: &U256) -> usize {
    u256_to_bytes32(slot).iter().filter(|b| **b != 0).count()
}

fn describe_slot(slot: &U256) -> String {
    if *slot < U256::from(SIMPLE_SLOT_BOUND) {
        format!("declared variable at slot {}", slot)
    } else if nonzero_slot_bytes(slot) > 16 {
        "mapping entry (hash-derived slot)".to_string()
    } else if *slot > U256::from(ARRAY_SLOT_BOUND) {
        "array element".to_string()
    } else {
        format!("storage slot {}", slot)
    }
}

/// Combine value shape with slot-number structure. Hash-derived slots are
/// mapping entries, very large sequential slots array elements.
fn classify(slot: &U256, value: &U256) -> SlotType {
    let value_type = infer_value_type(value);
    if value_type == SlotType::Empty {
        return SlotType::Empty;
    }
    if nonzero_slot_bytes(slot) > 16 {
        return SlotType::Mapping;
    }
    if *slot > U256::from(ARRAY_SLOT_BOUND) {
        return SlotType::Array;
    }
    value_type
}

fn score_importance(slot: &U256, slot_type: SlotType, value: &U256) -> f64 {
    let mut score: f64 = 0.5;
    score += match slot_type {
        SlotType::Address => 0.4,
        SlotType::Uint256 if in_balance_window(value) => 0.45,
        SlotType::Uint256 => 0.25,
        SlotType::Mapping => 0.35,
        SlotType::Bool => 0.2,
        SlotType::Array => 0.15,
        SlotType::Bytes32 => 0.1,
        SlotType::Empty => -0.4,
        _ => 0.0,
    };
    if *slot < U256::from(SIMPLE_SLOT_BOUND) {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

fn strategies_for(slot_type: SlotType, value: &U256, importance: f64) -> Vec<String> {
    let mut out: Vec<&str> = match slot_type {
        SlotType::Address => vec!["known_addresses", "flip_bytes", "boundary_values"],
        SlotType::Uint256 if in_balance_window(value) => {
            vec!["balance_scaling", "boundary_values"]
        }
        SlotType::Uint256 => vec!["boundary_values", "flip_bytes"],
        SlotType::Bool => vec!["boolean_flip"],
        SlotType::Mapping => vec!["key_mutation", "pattern_fill"],
        SlotType::Array => vec!["length_mutation", "boundary_values"],
        SlotType::Bytes32 => vec!["pattern_fill", "flip_bytes"],
        _ => vec![],
    };
    if importance > 0.8 {
        out.push("conservative_mutation");
    }
    out.into_iter().map(String::from).collect()
}

pub struct StorageAnalyzer;

impl StorageAnalyzer {
    /// Analyze a contract's storage snapshot. The ABI, when available, only
    /// contributes declared argument types as hints; layout information is
    /// not part of the function ABI.
    pub fn analyze(
        address: EVMAddress,
        storage: &StorageMap,
        abi: Option<&ContractAbi>,
    ) -> ContractAnalysis {
        let mut slots: Vec<StorageSlotInfo> = storage
            .iter()
            .map(|(slot, value)| Self::analyze_slot(*slot, *value, abi))
            .collect();
        // stable presentation: most important first, slot number breaks ties
        slots.sort_by(|a, b| {
            b.importance_score
                .partial_cmp(&a.importance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.slot.cmp(&b.slot))
        });
        ContractAnalysis {
            address,
            total_slots: slots.len(),
            abi_available: abi.is_some(),
            slots,
        }
    }

    pub fn analyze_slot(
        slot: EVMU256,
        value: EVMU256,
        abi: Option<&ContractAbi>,
    ) -> StorageSlotInfo {
        let slot_type = classify(&slot, &value);
        let importance_score = score_importance(&slot, slot_type, &value);
        let abi_type = abi.and_then(|a| abi_hint_for(a, slot_type));
        let (key_type, value_type) = if slot_type == SlotType::Mapping {
            (
                Some("unknown".to_string()),
                Some(format!("{:?}", infer_value_type(&value)).to_lowercase()),
            )
        } else {
            (None, None)
        };
        StorageSlotInfo {
            slot,
            value,
            slot_type,
            description: describe_slot(&slot),
            abi_type,
            key_type,
            value_type,
            mutation_strategies: strategies_for(slot_type, &value, importance_score),
            importance_score,
        }
    }
}

/// The strongest hint the function ABI can give: whether any callable takes
/// an argument whose declared type matches the inferred slot shape.
fn abi_hint_for(abi: &ContractAbi, slot_type: SlotType) -> Option<String> {
    let wanted = match slot_type {
        SlotType::Address => "address",
        SlotType::Bool => "bool",
        SlotType::Uint256 => "uint256",
        _ => return None,
    };
    abi.functions
        .iter()
        .flat_map(|f| f.inputs.iter())
        .map(|t| t.canonical())
        .find(|t| t == wanted)
}

/// Slots worth mutating, most important first.
pub fn important_slots(analysis: &ContractAnalysis, minimum: f64) -> Vec<&StorageSlotInfo> {
    analysis
        .slots
        .iter()
        .filter(|s| s.importance_score >= minimum && s.slot_type != SlotType::Empty)
        .collect_vec()
}
