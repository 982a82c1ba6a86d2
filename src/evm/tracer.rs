/// Opcode-level jump tracer scoped to the call subtree of one target
/// contract, plus the prefix-positional path similarity metric.
use serde::{Deserialize, Serialize};

use crate::evm::types::EVMAddress;

/// One taken control-flow edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionJump {
    pub contract_address: EVMAddress,
    pub from_pc: usize,
    pub dest_pc: usize,
}

pub type ExecutionPath = Vec<ExecutionJump>;

/// Records JUMP and taken-JUMPI edges, but only while (a) tracing has been
/// started and (b) the interpreter is inside the call subtree rooted at the
/// target contract. Either the intercepting host or the call-entry hook may
/// latch the target frame first; both paths are idempotent.
#[derive(Clone, Debug)]
pub struct JumpTracer {
    trace_active: bool,
    recording_active: bool,
    target_contract: Option<EVMAddress>,
    target_depth: i64,
    current_depth: i64,
    path: ExecutionPath,
}

impl Default for JumpTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl JumpTracer {
    pub fn new() -> Self {
        Self {
            trace_active: false,
            recording_active: false,
            target_contract: None,
            target_depth: -1,
            current_depth: 0,
            path: vec![],
        }
    }

    pub fn set_target_contract(&mut self, target: EVMAddress) {
        self.target_contract = Some(target);
    }

    pub fn clear_target_contract(&mut self) {
        self.target_contract = None;
    }

    pub fn start_trace(&mut self) {
        self.trace_active = true;
        self.recording_active = false;
        self.target_depth = -1;
        self.current_depth = 0;
        self.path.clear();
    }

    pub fn stop_trace(&mut self) {
        self.trace_active = false;
    }

    pub fn is_tracing(&self) -> bool {
        self.trace_active
    }

    pub fn path(&self) -> &ExecutionPath {
        &self.path
    }

    pub fn take_path(&mut self) -> ExecutionPath {
        std::mem::take(&mut self.path)
    }

    fn latch_if_target(&mut self, addr: EVMAddress) {
        if self.recording_active {
            return;
        }
        if self.target_contract == Some(addr) {
            self.recording_active = true;
            self.target_depth = self.current_depth;
        }
    }

    /// The intercepting host saw a call into a designated contract.
    pub fn on_target_contract_called(&mut self, addr: EVMAddress) {
        self.latch_if_target(addr);
    }

    /// A new call frame is entered at `depth`.
    pub fn on_enter(
        &mut self,
        depth: i64,
        _from: EVMAddress,
        _code_address: EVMAddress,
        to: EVMAddress,
    ) {
        self.current_depth = depth;
        self.latch_if_target(to);
    }

    /// A call frame at `depth` returned. Leaving the target frame (or any
    /// frame above it) ends recording.
    pub fn on_exit(&mut self, depth: i64) {
        if self.recording_active && depth <= self.target_depth {
            self.recording_active = false;
            self.target_depth = -1;
        }
        self.current_depth = depth - 1;
    }

    fn should_record(&self, depth: i64) -> bool {
        self.trace_active
            && (self.target_contract.is_none() || self.recording_active)
            && (self.target_depth == -1 || depth >= self.target_depth)
    }

    /// JUMP at `pc` with destination `dest`.
    pub fn on_jump(&mut self, contract: EVMAddress, depth: i64, pc: usize, dest: usize) {
        if !self.should_record(depth) {
            return;
        }
        self.path.push(ExecutionJump {
            contract_address: contract,
            from_pc: pc,
            dest_pc: dest,
        });
    }

    /// JUMPI at `pc`; only the taken branch is an edge.
    pub fn on_jumpi(
        &mut self,
        contract: EVMAddress,
        depth: i64,
        pc: usize,
        dest: usize,
        condition_nonzero: bool,
    ) {
        if !condition_nonzero {
            return;
        }
        self.on_jump(contract, depth, pc, dest);
    }
}

/// Prefix-positional similarity of two sequences: the number of positions
/// (below the shorter length) holding equal elements, over the longer
/// length. Not an edit distance: early divergence outweighs late agreement,
/// and sequences of unequal length are compared asymmetrically by design.
pub fn sequence_similarity<T: PartialEq>(a: &[T], b: &[T]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shorter = a.len().min(b.len());
    let longer = a.len().max(b.len());
    let matches = (0..shorter).filter(|&i| a[i] == b[i]).count();
    matches as f64 / longer as f64
}

/// [`sequence_similarity`] over execution paths, matching on the full
/// `(contract, from_pc, dest_pc)` triple.
pub fn path_similarity(a: &ExecutionPath, b: &ExecutionPath) -> f64 {
    sequence_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::fixed_address;

    fn target() -> EVMAddress {
        fixed_address("1111111111111111111111111111111111111111")
    }

    fn outer() -> EVMAddress {
        fixed_address("00000000000000000000000000000000000000aa")
    }

    fn jump(addr: EVMAddress, pc: usize, dest: usize) -> ExecutionJump {
        ExecutionJump {
            contract_address: addr,
            from_pc: pc,
            dest_pc: dest,
        }
    }

    #[test]
    fn nothing_recorded_before_start() {
        let mut tracer = JumpTracer::new();
        tracer.on_jump(outer(), 0, 1, 2);
        assert!(tracer.path().is_empty());
    }

    #[test]
    fn untargeted_tracer_records_everything() {
        let mut tracer = JumpTracer::new();
        tracer.start_trace();
        tracer.on_jump(outer(), 0, 1, 2);
        tracer.on_jumpi(outer(), 0, 3, 9, true);
        tracer.on_jumpi(outer(), 0, 4, 9, false); // not taken
        tracer.stop_trace();
        assert_eq!(tracer.path().len(), 2);
    }

    #[test]
    fn edges_outside_target_subtree_are_dropped() {
        // A -> B -> C with C protected: only edges while C's frame is on the
        // stack are kept.
        let mut tracer = JumpTracer::new();
        tracer.set_target_contract(target());
        tracer.start_trace();

        tracer.on_enter(0, outer(), outer(), outer());
        tracer.on_jump(outer(), 0, 10, 20); // outer code, before target
        tracer.on_enter(1, outer(), outer(), outer());
        tracer.on_jump(outer(), 1, 11, 21); // still outside
        tracer.on_enter(2, outer(), target(), target());
        tracer.on_jump(target(), 2, 12, 22); // inside target
        tracer.on_enter(3, target(), outer(), outer());
        tracer.on_jump(outer(), 3, 13, 23); // sub-call of target, kept
        tracer.on_exit(3);
        tracer.on_jump(target(), 2, 14, 24); // back in target
        tracer.on_exit(2);
        tracer.on_jump(outer(), 1, 15, 25); // after target returned
        tracer.on_exit(1);
        tracer.stop_trace();

        let pcs: Vec<usize> = tracer.path().iter().map(|j| j.from_pc).collect();
        assert_eq!(pcs, vec![12, 13, 14]);
    }

    #[test]
    fn latching_is_idempotent_in_either_order() {
        let run = |host_first: bool| {
            let mut tracer = JumpTracer::new();
            tracer.set_target_contract(target());
            tracer.start_trace();
            tracer.on_enter(0, outer(), outer(), outer());
            if host_first {
                tracer.on_target_contract_called(target());
                tracer.on_enter(1, outer(), target(), target());
            } else {
                tracer.on_enter(1, outer(), target(), target());
                tracer.on_target_contract_called(target());
            }
            tracer.on_jump(target(), 1, 5, 6);
            tracer.on_exit(1);
            tracer.on_jump(outer(), 0, 7, 8);
            tracer.path().clone()
        };
        let a = run(true);
        let b = run(false);
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].from_pc, 5);
    }

    #[test]
    fn reentering_target_records_again() {
        let mut tracer = JumpTracer::new();
        tracer.set_target_contract(target());
        tracer.start_trace();
        tracer.on_enter(1, outer(), target(), target());
        tracer.on_jump(target(), 1, 1, 2);
        tracer.on_exit(1);
        tracer.on_jump(outer(), 0, 3, 4); // dropped
        tracer.on_enter(1, outer(), target(), target());
        tracer.on_jump(target(), 1, 5, 6);
        tracer.on_exit(1);
        let pcs: Vec<usize> = tracer.path().iter().map(|j| j.from_pc).collect();
        assert_eq!(pcs, vec![1, 5]);
    }

    #[test]
    fn similarity_boundaries() {
        let a = vec![jump(target(), 1, 2)];
        let empty: ExecutionPath = vec![];
        assert_eq!(path_similarity(&empty, &empty), 1.0);
        assert_eq!(path_similarity(&a, &empty), 0.0);
        assert_eq!(path_similarity(&empty, &a), 0.0);
        assert_eq!(path_similarity(&a, &a), 1.0);
    }

    #[test]
    fn similarity_is_prefix_positional() {
        let x = jump(target(), 1, 2);
        let y = jump(target(), 3, 4);
        let z = jump(target(), 5, 6);
        assert_eq!(sequence_similarity(&[x, y], &[x, z]), 0.5);
        // late agreement does not rescue early divergence
        assert_eq!(sequence_similarity(&[z, y], &[x, y]), 0.5);
        // unequal lengths divide by the longer side
        assert_eq!(sequence_similarity(&[x, y, z, z], &[x, y]), 0.5);
    }

    #[test]
    fn similarity_stays_in_unit_interval() {
        let x = jump(target(), 1, 2);
        let y = jump(outer(), 9, 9);
        for (a, b) in [
            (vec![x; 10], vec![y; 3]),
            (vec![x; 1], vec![x; 100]),
            (vec![], vec![y; 5]),
        ] {
            let s = path_similarity(&a, &b);
            assert!((0.0..=1.0).contains(&s));
        }
    }
}
