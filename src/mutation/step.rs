/// ABI-unaware fallback mutator: deterministic step mutations over raw
/// calldata bytes and raw storage words.
use itertools::Itertools;
use primitive_types::U256;

use crate::evm::types::{EVMAddress, StorageMap};
use crate::mutation::{ModificationType, MutationCandidate};
use crate::r#const::DEFAULT_MAX_SLOT_CHANGES;

#[derive(Clone, Debug)]
pub struct StepMutationConfig {
    pub int_steps: Vec<i64>,
    pub uint_steps: Vec<u64>,
    /// applied to the low address bytes, modulo 256
    pub address_steps: Vec<u8>,
    pub bytes_steps: Vec<u8>,
    pub storage_steps: Vec<i64>,
    pub enable_nearby: bool,
    pub enable_boundary: bool,
    /// slots touched per storage candidate
    pub max_changes: usize,
    /// only slots present in the original snapshot may be modified
    pub only_prestate: bool,
    /// fall back to the subtract/xor/set cascade and, past that, the
    /// zero<->one swap when a step produces no net change
    pub force_change: bool,
}

impl Default for StepMutationConfig {
    fn default() -> Self {
        Self {
            int_steps: vec![1, 10, 100, 1000, -1, -10, -100, -1000],
            uint_steps: vec![1, 10, 100, 1000],
            address_steps: vec![1, 2, 3],
            bytes_steps: vec![0x01, 0xff],
            storage_steps: vec![1, 10, 100, -1, -10],
            enable_nearby: true,
            enable_boundary: true,
            max_changes: DEFAULT_MAX_SLOT_CHANGES,
            only_prestate: true,
            force_change: true,
        }
    }
}

/// Add a signed step to an unsigned word, saturating at zero.
pub fn apply_step(value: U256, step: i64) -> U256 {
    if step >= 0 {
        value.overflowing_add(U256::from(step as u64)).0
    } else {
        let delta = U256::from(step.unsigned_abs());
        if delta > value {
            U256::zero()
        } else {
            value - delta
        }
    }
}

pub struct StepMutator {
    pub config: StepMutationConfig,
}

impl StepMutator {
    pub fn new(config: StepMutationConfig) -> Self {
        Self { config }
    }

    fn storage_step_for(&self, variant: u64) -> i64 {
        let steps = &self.config.storage_steps;
        steps[(variant as usize / 3) % steps.len()]
    }

    fn calldata_step_for(&self, variant: u64) -> i64 {
        let steps = &self.config.int_steps;
        steps[(variant as usize / 3) % steps.len()]
    }

    /// True when a 32-byte parameter window holds an address-shaped value:
    /// zero upper 12 bytes and enough low entropy to not be a small number.
    fn window_is_address(window: &[u8]) -> bool {
        window.len() == 32
            && window[..12].iter().all(|b| *b == 0)
            && window[12..].iter().filter(|b| **b != 0).count() >= 4
    }

    /// Mutate calldata while preserving the 4-byte selector. Sub-mode is
    /// chosen by `variant mod 3`: big-integer step on the first parameter
    /// window, a single byte, or up to three bytes. Address-shaped first
    /// windows get their low byte nudged instead of a full-word step.
    /// Returns `None` when the mutation is a no-op.
    pub fn mutate_calldata(&self, original: &[u8], variant: u64, step: i64) -> Option<Vec<u8>> {
        if original.len() <= 4 {
            return None;
        }
        let mut data = original.to_vec();
        let params_len = data.len() - 4;
        match variant % 3 {
            0 => {
                let window = params_len.min(32);
                if self.config.enable_nearby && Self::window_is_address(&original[4..4 + window]) {
                    let steps = &self.config.address_steps;
                    let nudge = steps[(variant as usize / 3) % steps.len()];
                    data[4 + window - 1] = data[4 + window - 1].wrapping_add(nudge);
                } else {
                    // first 32-byte window (or the whole tail) as a big integer
                    let mut word = [0u8; 32];
                    word[32 - window..].copy_from_slice(&original[4..4 + window]);
                    let stepped = apply_step(U256::from_big_endian(&word), step);
                    stepped.to_big_endian(&mut word);
                    data[4..4 + window].copy_from_slice(&word[32 - window..]);
                }
            }
            1 => {
                let idx = 4 + (variant as usize % params_len);
                data[idx] = data[idx].wrapping_add(step as u8);
            }
            _ => {
                let deltas = &self.config.bytes_steps;
                for k in 0..3usize.min(params_len) {
                    let idx = 4 + ((variant as usize + k * 7) % params_len);
                    data[idx] = data[idx].wrapping_add(deltas[k % deltas.len()]);
                }
            }
        }
        if data == original {
            return None;
        }
        Some(data)
    }

    /// Boundary-value rewrite of one snapshot slot, used by the generator
    /// when boundary probing is enabled.
    pub fn boundary_storage(&self, snapshot: &StorageMap, variant: u64) -> StorageMap {
        let mut changes = StorageMap::new();
        if snapshot.is_empty() {
            return changes;
        }
        let slots = snapshot.keys().sorted().collect_vec();
        let slot = slots[variant as usize % slots.len()];
        let boundaries = [
            U256::zero(),
            U256::one(),
            U256::MAX,
            (U256::one() << 32) - U256::one(),
        ];
        let new = boundaries[(variant as usize / slots.len().max(1)) % boundaries.len()];
        if new != snapshot[slot] {
            changes.insert(*slot, new);
        }
        changes
    }

    /// Plain step application over the selected slot window; no fallback.
    fn step_changes(&self, snapshot: &StorageMap, variant: u64, step: i64) -> StorageMap {
        let mut changes = StorageMap::new();
        if snapshot.is_empty() {
            return changes;
        }
        let slots = snapshot.keys().sorted().collect_vec();
        let start = variant as usize % slots.len();
        for offset in 0..self.config.max_changes.min(slots.len()) {
            let slot = slots[(start + offset) % slots.len()];
            let old = snapshot[slot];
            let new = apply_step(old, step);
            if new != old {
                changes.insert(*slot, new);
            }
        }
        changes
    }

    /// Fallback when the step was absorbed: subtract, xor, set, and as the
    /// last resort swap zero and one on the selected slot.
    fn forced_changes(&self, snapshot: &StorageMap, variant: u64, step: i64) -> StorageMap {
        let mut changes = StorageMap::new();
        if snapshot.is_empty() {
            return changes;
        }
        let slots = snapshot.keys().sorted().collect_vec();
        let slot = slots[variant as usize % slots.len()];
        let old = snapshot[slot];
        for fallback in [
            apply_step(old, -step),
            old ^ U256::from(step.unsigned_abs()),
            U256::from(variant + 100),
        ] {
            if fallback != old {
                changes.insert(*slot, fallback);
                return changes;
            }
        }
        changes.insert(
            *slot,
            if old.is_zero() { U256::one() } else { U256::zero() },
        );
        changes
    }

    /// Step-mutate storage words. Only slots of the original snapshot are
    /// eligible; at most `max_changes` slots change per candidate. When the
    /// step is absorbed (saturation, zero step) the cascade kicks in, and
    /// past that the zero<->one swap, both gated by `force_change`.
    pub fn mutate_storage(&self, snapshot: &StorageMap, variant: u64, step: i64) -> StorageMap {
        let changes = self.step_changes(snapshot, variant, step);
        if changes.is_empty() && self.config.force_change && !snapshot.is_empty() {
            return self.forced_changes(snapshot, variant, step);
        }
        changes
    }

    /// Generate a batch of step-based candidates over the available
    /// surfaces. With both calldata and storage present, variants cycle
    /// through input / storage / both modifications.
    pub fn generate(
        &self,
        _contract: EVMAddress,
        calldata: Option<&[u8]>,
        snapshot: &StorageMap,
        count: usize,
        id_start: u64,
    ) -> Vec<MutationCandidate> {
        let mut out = vec![];
        let has_input = calldata.map(|d| d.len() > 4).unwrap_or(false);
        let has_storage = !snapshot.is_empty();
        if !has_input && !has_storage {
            return out;
        }
        for v in 0..count as u64 {
            let id = id_start + v;
            let mode = match (has_input, has_storage) {
                (true, true) => v % 3,
                (true, false) => 0,
                (false, true) => 1,
                (false, false) => unreachable!(),
            };
            let candidate = match mode {
                0 => self
                    .mutate_calldata(calldata.unwrap(), v, self.calldata_step_for(v))
                    .map(|input| {
                        MutationCandidate::new(
                            id,
                            Some(input),
                            StorageMap::new(),
                            ModificationType::InputStep,
                            "input_parameter_step",
                        )
                    }),
                1 => {
                    let boundary_turn = self.config.enable_boundary && v % 12 == 10;
                    let (changes, mod_type, strategy) = if boundary_turn {
                        (
                            self.boundary_storage(snapshot, v),
                            ModificationType::StorageStep,
                            "storage_boundary_value",
                        )
                    } else {
                        let step = self.storage_step_for(v);
                        let stepped = self.step_changes(snapshot, v, step);
                        if stepped.is_empty() && self.config.force_change {
                            (
                                self.forced_changes(snapshot, v, step),
                                ModificationType::ForcedStorage,
                                "storage_value_step",
                            )
                        } else {
                            (stepped, ModificationType::StorageStep, "storage_value_step")
                        }
                    };
                    if changes.is_empty() {
                        None
                    } else {
                        Some(MutationCandidate::new(id, None, changes, mod_type, strategy))
                    }
                }
                _ => {
                    let input = self.mutate_calldata(calldata.unwrap(), v, self.calldata_step_for(v));
                    let changes = self.mutate_storage(snapshot, v, self.storage_step_for(v));
                    if input.is_none() && changes.is_empty() {
                        None
                    } else {
                        Some(MutationCandidate::new(
                            id,
                            input,
                            changes,
                            ModificationType::BothStep,
                            "combined_step",
                        ))
                    }
                }
            };
            if let Some(c) = candidate {
                out.push(c.with_impact("shift execution path by stepped values"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::fixed_address;

    fn contract() -> EVMAddress {
        fixed_address("1111111111111111111111111111111111111111")
    }

    #[test]
    fn step_zero_is_identity() {
        assert_eq!(apply_step(U256::from(5u64), 0), U256::from(5u64));
        let mutator = StepMutator::new(StepMutationConfig {
            force_change: false,
            ..Default::default()
        });
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::from(7u64));
        assert!(mutator.mutate_storage(&snapshot, 0, 0).is_empty());
    }

    #[test]
    fn subtraction_saturates_at_zero() {
        assert_eq!(apply_step(U256::zero(), -1000), U256::zero());
        assert_eq!(apply_step(U256::from(3u64), -10), U256::zero());
        assert_eq!(apply_step(U256::from(10u64), -3), U256::from(7u64));
    }

    #[test]
    fn counter_bump_scenario() {
        // slot 0 = 1, variant 0, step 1 -> exactly { 0 -> 2 }
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::one());
        let changes = mutator.mutate_storage(&snapshot, 0, 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[&U256::zero()], U256::from(2u64));
    }

    #[test]
    fn selector_is_preserved() {
        // setUint1(42)
        let mut calldata = vec![0x69, 0x8c, 0xcd, 0x3a];
        calldata.extend_from_slice(&{
            let mut word = [0u8; 32];
            word[31] = 42;
            word
        });
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mutated = mutator.mutate_calldata(&calldata, 0, 1).unwrap();
        assert_eq!(&mutated[..4], &calldata[..4]);
        assert_eq!(mutated[35], 43);
        assert_eq!(mutated.len(), calldata.len());
    }

    #[test]
    fn selector_only_calldata_yields_nothing() {
        let mutator = StepMutator::new(StepMutationConfig::default());
        assert!(mutator.mutate_calldata(&[0x69, 0x8c, 0xcd, 0x3a], 0, 1).is_none());
    }

    #[test]
    fn only_prestate_slots_are_touched() {
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::from(3u64), U256::from(100u64));
        snapshot.insert(U256::from(8u64), U256::from(200u64));
        for variant in 0..20u64 {
            let changes = mutator.mutate_storage(&snapshot, variant, 7);
            for slot in changes.keys() {
                assert!(snapshot.contains_key(slot));
            }
        }
    }

    #[test]
    fn cascade_fires_when_step_is_absorbed() {
        // all-zero slot with a negative step saturates to no change; the
        // cascade must still produce a candidate
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::zero());
        let changes = mutator.mutate_storage(&snapshot, 0, -5);
        assert_eq!(changes.len(), 1);
        assert_ne!(changes[&U256::zero()], U256::zero());
    }

    #[test]
    fn forced_swap_flips_zero_and_one() {
        // step 0 defeats add, subtract and xor; set-to-variant+100 collides
        // with the stored value, leaving only the forced swap
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::from(100u64));
        let changes = mutator.mutate_storage(&snapshot, 0, 0);
        assert_eq!(changes[&U256::zero()], U256::zero());
    }

    #[test]
    fn address_shaped_window_gets_low_byte_nudge() {
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut calldata = vec![0xa9, 0x05, 0x9c, 0xbb];
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&[0x22u8; 20]); // address-shaped
        calldata.extend_from_slice(&word);
        let mutated = mutator.mutate_calldata(&calldata, 0, 1).unwrap();
        // only the lowest address byte moves
        assert_eq!(mutated[35], 0x23);
        assert_eq!(&mutated[4..35], &calldata[4..35]);
    }

    #[test]
    fn boundary_storage_rewrites_to_boundaries() {
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::from(500u64));
        let changes = mutator.boundary_storage(&snapshot, 0);
        assert_eq!(changes[&U256::zero()], U256::zero());
        let changes = mutator.boundary_storage(&snapshot, 2);
        assert_eq!(changes[&U256::zero()], U256::MAX);
    }

    #[test]
    fn forced_candidates_are_tagged() {
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::zero());
        // variants 9..=11 use step -1, which saturates on a zero slot
        let candidates = mutator.generate(contract(), None, &snapshot, 12, 0);
        assert!(candidates
            .iter()
            .any(|c| c.mod_type == ModificationType::ForcedStorage));
        assert!(candidates
            .iter()
            .any(|c| c.mod_type == ModificationType::StorageStep));
    }

    #[test]
    fn generate_respects_available_surfaces() {
        let mutator = StepMutator::new(StepMutationConfig::default());
        let mut snapshot = StorageMap::new();
        snapshot.insert(U256::zero(), U256::from(5u64));
        let candidates = mutator.generate(contract(), None, &snapshot, 9, 0);
        assert!(!candidates.is_empty());
        for c in &candidates {
            c.validate().unwrap();
            assert!(c.input_data.is_none());
        }

        let calldata = [vec![0xaa, 0xbb, 0xcc, 0xdd], vec![0u8; 32]].concat();
        let candidates = mutator.generate(contract(), Some(&calldata), &snapshot, 9, 100);
        let modes: std::collections::HashSet<_> =
            candidates.iter().map(|c| c.mod_type).collect();
        assert!(modes.contains(&ModificationType::InputStep));
        assert!(modes.contains(&ModificationType::StorageStep));
        assert!(modes.contains(&ModificationType::BothStep));
        // ids stay unique and increasing from the base
        let ids = candidates.iter().map(|c| c.id).collect_vec();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids[0] >= 100);
    }
}
