/// Mutation planning: distribute the adaptive batch across ranked
/// strategies, filter storage slots per strategy, and materialise concrete
/// candidates for the executor.
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;
use primitive_types::U256;
use tracing::debug;

use crate::analyzer::{SlotType, StorageSlotInfo};
use crate::evm::abi::{AbiFunction, ParamType, Token};
use crate::evm::types::{convert_u256_to_h160, EVMAddress, StorageMap};
use crate::mutation::step::{apply_step, StepMutator};
use crate::mutation::type_aware::{known_addresses_for_chain, TypeAwareMutator};
use crate::mutation::{ModificationType, MutationCandidate};
use crate::strategy::{is_storage_strategy, StrategySnapshot};

#[derive(Clone, Debug)]
pub struct StorageMutationPlan {
    pub strategy: String,
    pub slots: Vec<StorageSlotInfo>,
    pub variants: usize,
    pub priority: u8,
}

#[derive(Clone, Debug)]
pub struct InputMutationPlan {
    pub strategy: String,
    /// 32-byte parameter positions available after the selector
    pub param_count: usize,
    pub variants: usize,
    pub priority: u8,
}

#[derive(Clone, Debug)]
pub struct MutationPlan {
    pub contract: EVMAddress,
    pub total_variants: usize,
    pub storage_mutations: Vec<StorageMutationPlan>,
    pub input_mutations: Vec<InputMutationPlan>,
    pub priority_order: Vec<String>,
}

/// Slot filter per storage strategy; unspecialised strategies fall back to
/// importance order.
fn filter_slots(strategy: &str, slots: &[StorageSlotInfo]) -> Vec<StorageSlotInfo> {
    let filtered: Vec<StorageSlotInfo> = match strategy {
        "storage_address_mutation" => slots
            .iter()
            .filter(|s| s.slot_type == SlotType::Address)
            .cloned()
            .collect(),
        "storage_balance_scaling" => slots
            .iter()
            .filter(|s| s.is_balance_like())
            .cloned()
            .collect(),
        "storage_counter_increment" => slots
            .iter()
            .filter(|s| s.is_counter_like())
            .cloned()
            .collect(),
        "storage_bool_flip" => slots
            .iter()
            .filter(|s| s.slot_type == SlotType::Bool)
            .cloned()
            .collect(),
        "storage_mapping_key_mutation" => slots
            .iter()
            .filter(|s| s.slot_type == SlotType::Mapping)
            .cloned()
            .collect(),
        "storage_array_length_mutation" => slots
            .iter()
            .filter(|s| s.slot_type == SlotType::Array)
            .cloned()
            .collect(),
        _ => slots
            .iter()
            .filter(|s| s.slot_type != SlotType::Empty)
            .sorted_by(|a, b| {
                b.importance_score
                    .partial_cmp(&a.importance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .collect(),
    };
    filtered
}

pub struct MutationPlanner {
    pub type_aware: TypeAwareMutator,
    pub step: StepMutator,
    pub enable_type_aware: bool,
    /// constants mined from the target contract's bytecode, used by the
    /// constant-hinted input strategy
    pub constant_pool: Vec<U256>,
    next_id: AtomicU64,
}

impl MutationPlanner {
    pub fn new(type_aware: TypeAwareMutator, step: StepMutator) -> Self {
        Self {
            type_aware,
            step,
            enable_type_aware: true,
            constant_pool: vec![],
            next_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Distribute the adaptive batch over the ranked strategies:
    /// `ceil(N/k)` variants each, truncated at `N` overall.
    pub fn build_plan(
        &self,
        contract: EVMAddress,
        slots: &[StorageSlotInfo],
        calldata_len: usize,
        snapshot: &StrategySnapshot,
    ) -> MutationPlan {
        let total = snapshot.batch_size;
        let k = snapshot.ranked.len().max(1);
        let per_strategy = (total + k - 1) / k;
        let mut remaining = total;
        let mut storage_mutations = vec![];
        let mut input_mutations = vec![];
        let param_count = calldata_len.saturating_sub(4) / 32;

        for ranked in &snapshot.ranked {
            if remaining == 0 {
                break;
            }
            let variants = per_strategy.min(remaining);
            remaining -= variants;
            if is_storage_strategy(&ranked.name) {
                let matching = filter_slots(&ranked.name, slots);
                if matching.is_empty() {
                    continue;
                }
                storage_mutations.push(StorageMutationPlan {
                    strategy: ranked.name.clone(),
                    slots: matching,
                    variants,
                    priority: ranked.priority,
                });
            } else {
                if param_count == 0 {
                    continue;
                }
                input_mutations.push(InputMutationPlan {
                    strategy: ranked.name.clone(),
                    param_count,
                    variants,
                    priority: ranked.priority,
                });
            }
        }

        debug!(
            "plan for {:?}: {} storage / {} input strategies over {} variants",
            contract,
            storage_mutations.len(),
            input_mutations.len(),
            total
        );
        MutationPlan {
            contract,
            total_variants: total,
            storage_mutations,
            input_mutations,
            priority_order: snapshot.ranked.iter().map(|r| r.name.clone()).collect(),
        }
    }

    /// Materialise candidates from a plan against the live snapshot and the
    /// original calldata. Distinct strategies can land on the same concrete
    /// diff, so the batch is deduplicated before execution.
    pub fn generate(
        &self,
        plan: &MutationPlan,
        storage: &StorageMap,
        calldata: Option<&[u8]>,
        function: Option<&AbiFunction>,
    ) -> Vec<MutationCandidate> {
        let mut out: Vec<MutationCandidate> = vec![];
        let mut seen: std::collections::HashSet<(Option<Vec<u8>>, Vec<(U256, U256)>)> =
            std::collections::HashSet::new();
        let mut push_unique = |out: &mut Vec<MutationCandidate>, c: MutationCandidate| {
            let key = (
                c.input_data.clone(),
                c.storage_changes.iter().map(|(k, v)| (*k, *v)).sorted().collect(),
            );
            if seen.insert(key) {
                out.push(c);
            }
        };
        for entry in &plan.storage_mutations {
            for v in 0..entry.variants as u64 {
                if let Some(c) = self.storage_candidate(entry, storage, v) {
                    push_unique(&mut out, c);
                }
            }
        }
        if let Some(calldata) = calldata {
            for entry in &plan.input_mutations {
                for v in 0..entry.variants as u64 {
                    if let Some(c) = self.input_candidate(entry, calldata, function, v) {
                        push_unique(&mut out, c);
                    }
                }
            }
        }
        out
    }

    fn storage_candidate(
        &self,
        plan: &StorageMutationPlan,
        storage: &StorageMap,
        variant: u64,
    ) -> Option<MutationCandidate> {
        let slot_info = &plan.slots[variant as usize % plan.slots.len()];
        let old = storage.get(&slot_info.slot).cloned().unwrap_or(slot_info.value);
        let mut changes = StorageMap::new();

        match plan.strategy.as_str() {
            "storage_bool_flip" => {
                let new = if old.is_zero() { U256::one() } else { U256::zero() };
                changes.insert(slot_info.slot, new);
            }
            "storage_counter_increment" => {
                let steps: [i64; 6] = [1, 10, 100, -1, -10, -100];
                let new = apply_step(old, steps[variant as usize % steps.len()]);
                if new == old {
                    return None;
                }
                changes.insert(slot_info.slot, new);
            }
            "storage_balance_scaling" => {
                let new = match variant % 4 {
                    0 => old.overflowing_mul(U256::from(2u64)).0,
                    1 => old.overflowing_mul(U256::from(10u64)).0,
                    2 => old / U256::from(2u64),
                    _ => U256::zero(),
                };
                if new == old {
                    return None;
                }
                changes.insert(slot_info.slot, new);
            }
            "storage_address_mutation" => {
                let addr = convert_u256_to_h160(old);
                let mutated = self.type_aware.mutate_token(
                    &Token::Address(addr),
                    &ParamType::Address,
                    variant,
                )?;
                if let Token::Address(new_addr) = mutated {
                    changes.insert(
                        slot_info.slot,
                        crate::evm::types::convert_h160_to_u256(new_addr),
                    );
                }
            }
            "storage_array_length_mutation" => {
                let steps: [i64; 4] = [1, -1, 10, -10];
                let new = apply_step(old, steps[variant as usize % steps.len()]);
                if new == old {
                    return None;
                }
                changes.insert(slot_info.slot, new);
            }
            "multi_slot_coordinated" => {
                let subset: StorageMap = plan
                    .slots
                    .iter()
                    .filter_map(|s| storage.get(&s.slot).map(|v| (s.slot, *v)))
                    .collect();
                changes = self.step.mutate_storage(&subset, variant, 1 + (variant % 10) as i64);
            }
            "dependency_aware_mutation" => {
                // shift two importance-adjacent slots by the same step so a
                // guarded relation between them is preserved
                let step = 1 + (variant % 100) as i64;
                for s in plan
                    .slots
                    .iter()
                    .cycle()
                    .skip(variant as usize % plan.slots.len())
                    .take(2.min(plan.slots.len()))
                {
                    let value = storage.get(&s.slot).cloned().unwrap_or(s.value);
                    let new = apply_step(value, step);
                    if new != value {
                        changes.insert(s.slot, new);
                    }
                }
            }
            _ => {
                let new = apply_step(old, 1 + (variant % 1000) as i64);
                if new == old {
                    return None;
                }
                changes.insert(slot_info.slot, new);
            }
        }

        if changes.is_empty() {
            return None;
        }
        Some(
            MutationCandidate::new(
                self.next_id(),
                None,
                changes,
                ModificationType::StorageStep,
                plan.strategy.clone(),
            )
            .with_priority(plan.priority as i32)
            .with_impact(format!("{} on {}", plan.strategy, slot_info.description)),
        )
    }

    fn input_candidate(
        &self,
        plan: &InputMutationPlan,
        calldata: &[u8],
        function: Option<&AbiFunction>,
        variant: u64,
    ) -> Option<MutationCandidate> {
        let mutated = match plan.strategy.as_str() {
            "input_parameter_step" => {
                self.step
                    .mutate_calldata(calldata, variant, self.step_for_variant(variant))
            }
            "input_boundary_values" => match self.typed_function(function) {
                Some(f) => self.typed_uint_rewrite(f, calldata, variant, |m, v, var| {
                    let bounds = &m.number_config.boundary_values;
                    let new = U256::from(bounds[var as usize % bounds.len()]);
                    if new == v {
                        None
                    } else {
                        Some(new)
                    }
                }),
                None => self.window_rewrite(calldata, variant, |word, var| {
                    let bounds: [u64; 5] = [0, 1, 255, 65535, u32::MAX as u64];
                    U256::from(bounds[var as usize % bounds.len()]).to_big_endian(word);
                }),
            },
            "input_bit_patterns" => match self.typed_function(function) {
                Some(f) => self.typed_uint_rewrite(f, calldata, variant, |m, v, var| {
                    let patterns = &m.number_config.bit_patterns;
                    let new = U256::from(patterns[var as usize % patterns.len()]);
                    if new == v {
                        None
                    } else {
                        Some(new)
                    }
                }),
                None => self.window_rewrite(calldata, variant, |word, var| {
                    let patterns: [u8; 3] = [0xff, 0xaa, 0x55];
                    word.fill(patterns[var as usize % patterns.len()]);
                }),
            },
            "input_address_substitution" => {
                let f = self.typed_function(function)?;
                let mut tokens = f.decode_input(calldata).ok()?;
                let pool = known_addresses_for_chain(self.type_aware.chain_id);
                let address_positions: Vec<usize> = f
                    .inputs
                    .iter()
                    .positions(|t| *t == ParamType::Address)
                    .collect();
                if address_positions.is_empty() {
                    return None;
                }
                let pos = address_positions[variant as usize % address_positions.len()];
                let replacement = pool[(variant as usize / address_positions.len().max(1))
                    % pool.len()];
                if tokens[pos] == Token::Address(replacement) {
                    return None;
                }
                tokens[pos] = Token::Address(replacement);
                f.encode_input(&tokens).ok()
            }
            "input_constant_hinted" => {
                if self.constant_pool.is_empty() {
                    return None;
                }
                let constant = self.constant_pool[variant as usize % self.constant_pool.len()];
                self.window_rewrite(calldata, variant, |word, _var| {
                    // right-aligned, the way the constant sits in a word
                    constant.to_big_endian(word);
                })
            }
            "bytes_pattern_fill" => self.window_rewrite(calldata, variant, |word, var| {
                let patterns: [u8; 3] = [0xff, 0xaa, 0x55];
                word.fill(patterns[var as usize % patterns.len()]);
            }),
            _ => self
                .step
                .mutate_calldata(calldata, variant, self.step_for_variant(variant)),
        }?;

        if mutated == calldata {
            return None;
        }
        Some(
            MutationCandidate::new(
                self.next_id(),
                Some(mutated),
                StorageMap::new(),
                ModificationType::InputStep,
                plan.strategy.clone(),
            )
            .with_priority(plan.priority as i32)
            .with_impact(format!("{} over {} params", plan.strategy, plan.param_count)),
        )
    }

    fn typed_function<'a>(&self, function: Option<&'a AbiFunction>) -> Option<&'a AbiFunction> {
        if self.enable_type_aware {
            function
        } else {
            None
        }
    }

    fn step_for_variant(&self, variant: u64) -> i64 {
        let steps = &self.step.config.int_steps;
        steps[(variant as usize / 3) % steps.len()]
    }

    /// Rewrite one uint argument through the ABI coder.
    fn typed_uint_rewrite(
        &self,
        function: &AbiFunction,
        calldata: &[u8],
        variant: u64,
        rewrite: impl Fn(&TypeAwareMutator, U256, u64) -> Option<U256>,
    ) -> Option<Vec<u8>> {
        let mut tokens = function.decode_input(calldata).ok()?;
        let uint_positions: Vec<usize> = function
            .inputs
            .iter()
            .positions(|t| matches!(t, ParamType::Uint(_)))
            .collect();
        if uint_positions.is_empty() {
            return None;
        }
        let pos = uint_positions[variant as usize % uint_positions.len()];
        let current = match &tokens[pos] {
            Token::Uint(v) => *v,
            _ => return None,
        };
        let new = rewrite(
            &self.type_aware,
            current,
            variant / uint_positions.len() as u64,
        )?;
        tokens[pos] = Token::Uint(new);
        function.encode_input(&tokens).ok()
    }

    /// Raw 32-byte window rewrite for the ABI-unaware path. The selector is
    /// never touched.
    fn window_rewrite(
        &self,
        calldata: &[u8],
        variant: u64,
        write: impl Fn(&mut [u8], u64),
    ) -> Option<Vec<u8>> {
        let param_count = calldata.len().saturating_sub(4) / 32;
        if param_count == 0 {
            return None;
        }
        let idx = variant as usize % param_count;
        let mut out = calldata.to_vec();
        let start = 4 + idx * 32;
        write(&mut out[start..start + 32], variant / param_count as u64);
        if out == calldata {
            None
        } else {
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::StorageAnalyzer;
    use crate::evm::abi::ContractAbi;
    use crate::evm::types::fixed_address;
    use crate::mutation::step::StepMutationConfig;
    use crate::strategy::StrategyManager;

    fn planner() -> MutationPlanner {
        MutationPlanner::new(
            TypeAwareMutator::new(1),
            StepMutator::new(StepMutationConfig::default()),
        )
    }

    fn contract() -> EVMAddress {
        fixed_address("1111111111111111111111111111111111111111")
    }

    fn analyzed_slots(storage: &StorageMap) -> Vec<StorageSlotInfo> {
        StorageAnalyzer::analyze(contract(), storage, None).slots
    }

    fn sample_storage() -> StorageMap {
        let mut storage = StorageMap::new();
        storage.insert(U256::zero(), U256::one()); // bool
        storage.insert(U256::from(1u64), U256::exp10(18)); // balance
        storage.insert(U256::from(2u64), U256::from(7u64)); // counter
        storage
    }

    #[test]
    fn plan_distributes_and_truncates() {
        let manager = StrategyManager::new(0.7);
        let snapshot = manager.snapshot();
        let p = planner();
        let storage = sample_storage();
        let plan = p.build_plan(contract(), &analyzed_slots(&storage), 4 + 64, &snapshot);
        assert_eq!(plan.total_variants, snapshot.batch_size);
        let allocated: usize = plan
            .storage_mutations
            .iter()
            .map(|e| e.variants)
            .chain(plan.input_mutations.iter().map(|e| e.variants))
            .sum();
        assert!(allocated <= snapshot.batch_size);
        assert_eq!(plan.priority_order.len(), snapshot.ranked.len());
    }

    #[test]
    fn slot_filters_respect_types() {
        let storage = sample_storage();
        let slots = analyzed_slots(&storage);
        let bools = filter_slots("storage_bool_flip", &slots);
        assert!(bools.iter().all(|s| s.slot_type == SlotType::Bool));
        assert_eq!(bools.len(), 1);
        let balances = filter_slots("storage_balance_scaling", &slots);
        assert!(balances.iter().all(|s| s.is_balance_like()));
        let counters = filter_slots("storage_counter_increment", &slots);
        assert!(counters.iter().all(|s| s.is_counter_like()));
        // fallback keeps everything non-empty, importance first
        let fallback = filter_slots("multi_slot_coordinated", &slots);
        assert_eq!(fallback.len(), 3);
        assert!(fallback[0].importance_score >= fallback[1].importance_score);
    }

    #[test]
    fn no_parameters_means_no_input_plans() {
        let manager = StrategyManager::new(0.7);
        let p = planner();
        let storage = sample_storage();
        let plan = p.build_plan(contract(), &analyzed_slots(&storage), 4, &manager.snapshot());
        assert!(plan.input_mutations.is_empty());
        assert!(!plan.storage_mutations.is_empty());
    }

    #[test]
    fn generated_candidates_are_valid_and_attributed() {
        let manager = StrategyManager::new(0.7);
        let p = planner();
        let storage = sample_storage();
        let slots = analyzed_slots(&storage);
        let plan = p.build_plan(contract(), &slots, 4 + 64, &manager.snapshot());

        let calldata = [vec![0xa9, 0x05, 0x9c, 0xbb], vec![0u8; 64]].concat();
        let candidates = p.generate(&plan, &storage, Some(&calldata), None);
        assert!(!candidates.is_empty());
        for c in &candidates {
            c.validate().unwrap();
            assert!(plan.priority_order.contains(&c.strategy));
            if let Some(input) = &c.input_data {
                assert_eq!(&input[..4], &calldata[..4]);
            }
            for slot in c.storage_changes.keys() {
                assert!(storage.contains_key(slot));
            }
        }
        // ids unique across the batch
        let ids: std::collections::HashSet<u64> = candidates.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), candidates.len());
    }

    #[test]
    fn duplicate_diffs_are_collapsed() {
        let p = planner();
        let storage = sample_storage();
        let slots = analyzed_slots(&storage);
        // two plan entries that both flip the one bool slot the same way
        let plan = MutationPlan {
            contract: contract(),
            total_variants: 4,
            storage_mutations: vec![
                StorageMutationPlan {
                    strategy: "storage_bool_flip".to_string(),
                    slots: filter_slots("storage_bool_flip", &slots),
                    variants: 2,
                    priority: 5,
                },
                StorageMutationPlan {
                    strategy: "storage_bool_flip".to_string(),
                    slots: filter_slots("storage_bool_flip", &slots),
                    variants: 2,
                    priority: 5,
                },
            ],
            input_mutations: vec![],
            priority_order: vec!["storage_bool_flip".to_string()],
        };
        let candidates = p.generate(&plan, &storage, None, None);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn bool_flip_candidates_flip() {
        let p = planner();
        let storage = sample_storage();
        let slots = analyzed_slots(&storage);
        let plan = StorageMutationPlan {
            strategy: "storage_bool_flip".to_string(),
            slots: filter_slots("storage_bool_flip", &slots),
            variants: 1,
            priority: 5,
        };
        let c = p.storage_candidate(&plan, &storage, 0).unwrap();
        assert_eq!(c.storage_changes[&U256::zero()], U256::zero());
    }

    #[test]
    fn constant_hints_land_in_parameter_windows() {
        let mut p = planner();
        p.constant_pool = vec![U256::from(0xdead_beefu64)];
        let calldata = [vec![0xa9, 0x05, 0x9c, 0xbb], vec![0u8; 32]].concat();
        let plan = InputMutationPlan {
            strategy: "input_constant_hinted".to_string(),
            param_count: 1,
            variants: 1,
            priority: 5,
        };
        let c = p.input_candidate(&plan, &calldata, None, 0).unwrap();
        let input = c.input_data.unwrap();
        assert_eq!(&input[..4], &calldata[..4]);
        assert_eq!(U256::from_big_endian(&input[4..36]), U256::from(0xdead_beefu64));

        // an empty pool produces nothing
        p.constant_pool.clear();
        assert!(p.input_candidate(&plan, &calldata, None, 0).is_none());
    }

    #[test]
    fn typed_address_substitution_uses_pool() {
        let abi = ContractAbi::parse_abi_str(
            r#"[{"type":"function","name":"transfer","stateMutability":"nonpayable",
                "inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}]}]"#,
        )
        .unwrap();
        let f = abi.function_by_selector([0xa9, 0x05, 0x9c, 0xbb]).unwrap();
        let calldata = f
            .encode_input(&[
                Token::Address(fixed_address("2222222222222222222222222222222222222222")),
                Token::Uint(U256::from(5u64)),
            ])
            .unwrap();
        let p = planner();
        let plan = InputMutationPlan {
            strategy: "input_address_substitution".to_string(),
            param_count: 2,
            variants: 1,
            priority: 5,
        };
        let c = p.input_candidate(&plan, &calldata, Some(f), 0).unwrap();
        let tokens = f.decode_input(c.input_data.as_ref().unwrap()).unwrap();
        match &tokens[0] {
            Token::Address(addr) => {
                assert!(known_addresses_for_chain(1).contains(addr));
            }
            other => panic!("unexpected token {:?}", other),
        }
    }
}
