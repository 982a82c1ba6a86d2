/// Mutation data model: candidates, per-candidate execution results and the
/// aggregated collection handed back to the caller.
pub mod planner;
pub mod step;
pub mod type_aware;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::errors::{ReplayError, Result};
use crate::evm::calltrace::{CallTrace, ExtractedCall};
use crate::evm::prestate::AllContractsStorage;
use crate::evm::tracer::ExecutionPath;
use crate::evm::types::{u256_to_bytes32, EVMAddress, StorageMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationType {
    InputStep,
    StorageStep,
    BothStep,
    ForcedInput,
    ForcedStorage,
}

/// One proposed variant: modified calldata and/or a storage overlay,
/// executed against the unchanged prestate. Read-only once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationCandidate {
    pub id: u64,
    pub input_data: Option<Vec<u8>>,
    pub storage_changes: StorageMap,
    pub mod_type: ModificationType,
    pub strategy: String,
    pub priority: i32,
    pub expected_impact: String,
    pub generated_at: u64,
    pub source_call: Option<ExtractedCall>,
}

impl MutationCandidate {
    pub fn new(
        id: u64,
        input_data: Option<Vec<u8>>,
        storage_changes: StorageMap,
        mod_type: ModificationType,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            id,
            input_data,
            storage_changes,
            mod_type,
            strategy: strategy.into(),
            priority: 5,
            expected_impact: String::new(),
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            source_call: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.expected_impact = impact.into();
        self
    }

    pub fn with_source_call(mut self, call: ExtractedCall) -> Self {
        self.source_call = Some(call);
        self
    }

    /// A candidate that changes nothing is not a candidate.
    pub fn validate(&self) -> Result<()> {
        let has_input = self.input_data.as_ref().map(|d| !d.is_empty()).unwrap_or(false);
        if !has_input && self.storage_changes.is_empty() {
            return Err(ReplayError::mutation(format!(
                "candidate {} carries neither input nor storage changes",
                self.id
            )));
        }
        Ok(())
    }
}

/// Execution outcome of one candidate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationResult {
    pub candidate: MutationCandidate,
    pub similarity: f64,
    pub success: bool,
    pub error: Option<String>,
    pub execution_path: ExecutionPath,
    pub gas_used: u64,
    pub duration: Duration,
}

impl MutationResult {
    pub fn is_variant(&self, threshold: f64) -> bool {
        self.success && self.similarity >= threshold
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MutationStats {
    pub total_mutations: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub average_similarity: f64,
    pub highest_similarity: f64,
}

/// Everything a replay produced, returned to the caller in one piece.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationCollection {
    pub original_tx_hash: H256,
    pub contract_address: EVMAddress,
    pub results: Vec<MutationResult>,
    pub successful: Vec<MutationResult>,
    pub stats: MutationStats,
    pub similarity_threshold: f64,
    pub call_trace: Option<CallTrace>,
    pub all_contracts_storage: AllContractsStorage,
}

impl MutationCollection {
    pub fn from_results(
        original_tx_hash: H256,
        contract_address: EVMAddress,
        results: Vec<MutationResult>,
        similarity_threshold: f64,
        call_trace: Option<CallTrace>,
        all_contracts_storage: AllContractsStorage,
    ) -> Self {
        let successful: Vec<MutationResult> = results
            .iter()
            .filter(|r| r.is_variant(similarity_threshold))
            .cloned()
            .collect();
        let total = results.len();
        let average_similarity = if total == 0 {
            0.0
        } else {
            results.iter().map(|r| r.similarity).sum::<f64>() / total as f64
        };
        let highest_similarity = results
            .iter()
            .map(|r| r.similarity)
            .fold(0.0f64, f64::max);
        let stats = MutationStats {
            total_mutations: total,
            success_count: successful.len(),
            failure_count: total - successful.len(),
            average_similarity,
            highest_similarity,
        };
        Self {
            original_tx_hash,
            contract_address,
            results,
            successful,
            stats,
            similarity_threshold,
            call_trace,
            all_contracts_storage,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ReplayError::new(
                crate::errors::ErrorKind::Encoding,
                format!("collection serialization failed: {}", e),
            )
        })
    }

    /// Persist the collection as JSON next to the work directory.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReplayError::storage(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, json)
            .map_err(|e| ReplayError::storage(format!("cannot write {}: {}", path.display(), e)))
    }

    /// One-line operator summary.
    pub fn summary(&self) -> String {
        format!(
            "{:?} @ 0x{:x}: {} mutants, {} variants >= {:.2} (best {:.4}, avg {:.4})",
            self.original_tx_hash,
            self.contract_address,
            self.stats.total_mutations,
            self.stats.success_count,
            self.similarity_threshold,
            self.stats.highest_similarity,
            self.stats.average_similarity,
        )
    }

    /// Integer-similarity projection for on-chain consumers.
    pub fn to_solidity_format(&self) -> SolidityMutations {
        let orig_input = self
            .call_trace
            .as_ref()
            .and_then(|t| t.extraction_for(self.contract_address))
            .map(|e| hex::encode(&e.input_data))
            .unwrap_or_default();
        let mut input_mutations = vec![];
        let mut storage_mutations = vec![];
        let mut similarities = vec![];
        for result in &self.successful {
            if let Some(input) = &result.candidate.input_data {
                input_mutations.push(hex::encode(input));
            }
            for (slot, value) in &result.candidate.storage_changes {
                storage_mutations.push((
                    hex::encode(u256_to_bytes32(slot)),
                    hex::encode(u256_to_bytes32(value)),
                ));
            }
            similarities.push((result.similarity * 10000.0).round() as u64);
        }
        SolidityMutations {
            orig_tx_hash: format!("{:?}", self.original_tx_hash),
            contract_addr: format!("0x{:x}", self.contract_address),
            orig_input,
            input_mutations,
            storage_mutations,
            similarities,
            total: self.stats.total_mutations,
            success_count: self.stats.success_count,
        }
    }
}

/// Downstream projection with similarities scaled to integers (x10000).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolidityMutations {
    pub orig_tx_hash: String,
    pub contract_addr: String,
    pub orig_input: String,
    pub input_mutations: Vec<String>,
    pub storage_mutations: Vec<(String, String)>,
    pub similarities: Vec<u64>,
    pub total: usize,
    pub success_count: usize,
}

/// Payload for the optional transaction sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationData {
    pub input_data: Vec<u8>,
    pub value: U256,
}
