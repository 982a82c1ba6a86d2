/// The intercepting EVM: a `revm` host that dispatches sub-calls through
/// nested interpreters, rewrites calldata for designated target contracts,
/// and feeds control-flow edges to the jump tracer.
use std::collections::HashMap;

use bytes::Bytes;
use primitive_types::{H160, H256, U256};
use revm::db::BenchmarkDB;
use revm::Return::{Continue, Revert, Stop};
use revm::{
    Bytecode, CallInputs, CallScheme, Contract, CreateInputs, Env, Gas, Host, Interpreter,
    LatestSpec, Return, SelfDestructResult, Spec,
};

use crate::evm::prestate::{AllContractsStorage, PrestateResult};
use crate::evm::tracer::JumpTracer;
use crate::evm::types::{keccak256, EVMAddress, EVMU256, StorageMap};
use crate::r#const::EVM_CALL_GAS;

const OP_JUMP: u8 = 0x56;
const OP_JUMPI: u8 = 0x57;

/// Mutable account view the host executes against. Each mutant execution
/// materialises a fresh copy from the shared prestate.
#[derive(Clone, Debug, Default)]
pub struct ReplayState {
    pub storage: HashMap<EVMAddress, StorageMap>,
    pub balances: HashMap<EVMAddress, EVMU256>,
}

impl ReplayState {
    pub fn from_prestate(prestate: &PrestateResult) -> Self {
        let mut state = Self::default();
        for (addr, account) in prestate {
            if !account.storage.is_empty() {
                state.storage.insert(*addr, account.storage.clone());
            }
            if let Some(balance) = account.balance {
                state.balances.insert(*addr, balance);
            }
        }
        state
    }

    /// Lay a full multi-contract snapshot over the current storage.
    pub fn overlay_storage(&mut self, snapshot: &AllContractsStorage) {
        for (addr, slots) in snapshot {
            let entry = self.storage.entry(*addr).or_default();
            for (slot, value) in slots {
                entry.insert(*slot, *value);
            }
        }
    }

    /// Apply a candidate's storage diff for one contract.
    pub fn apply_changes(&mut self, address: EVMAddress, changes: &StorageMap) {
        if changes.is_empty() {
            return;
        }
        let entry = self.storage.entry(address).or_default();
        for (slot, value) in changes {
            entry.insert(*slot, *value);
        }
    }

    pub fn sload(&self, address: &EVMAddress, slot: &EVMU256) -> EVMU256 {
        self.storage
            .get(address)
            .and_then(|slots| slots.get(slot))
            .cloned()
            .unwrap_or_else(EVMU256::zero)
    }

    pub fn sstore(&mut self, address: EVMAddress, slot: EVMU256, value: EVMU256) {
        self.storage.entry(address).or_default().insert(slot, value);
    }
}

/// Calldata override table: `Some(bytes)` rewrites the input of calls into
/// that address, `None` only notifies the tracer. The latter mode is used
/// when replaying the original transaction, so the tracer can find the
/// target frame without changing semantics.
pub type TargetOverrides = HashMap<EVMAddress, Option<Vec<u8>>>;

pub struct InterceptingHost {
    pub state: ReplayState,
    pub env: Env,
    pub code: HashMap<EVMAddress, Bytecode>,
    pub targets: TargetOverrides,
    pub tracer: JumpTracer,
    depth: i64,
    create_counter: u64,
    /// create frames currently on the stack; their edges are never recorded
    create_frames: u32,
}

impl InterceptingHost {
    pub fn new(env: Env) -> Self {
        Self {
            state: ReplayState::default(),
            env,
            code: HashMap::new(),
            targets: TargetOverrides::new(),
            tracer: JumpTracer::new(),
            depth: 0,
            create_counter: 0,
            create_frames: 0,
        }
    }

    pub fn set_code(&mut self, address: EVMAddress, code: Bytecode) {
        self.code.insert(address, code.to_analysed::<LatestSpec>());
    }

    pub fn load_prestate_code(&mut self, prestate: &PrestateResult) {
        for (addr, account) in prestate {
            if let Some(code) = &account.code {
                if !code.is_empty() {
                    self.set_code(*addr, Bytecode::new_raw(Bytes::from(code.clone())));
                }
            }
        }
    }

    pub fn set_target(&mut self, address: EVMAddress, replacement: Option<Vec<u8>>) {
        self.targets.insert(address, replacement);
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// The address the interception table is checked against, per call kind.
    /// CALL/STATICCALL look at the callee, DELEGATECALL at the code source,
    /// CALLCODE at the caller.
    fn intercept_address(input: &CallInputs) -> EVMAddress {
        match input.context.scheme {
            CallScheme::Call | CallScheme::StaticCall => input.contract,
            CallScheme::DelegateCall => input.context.code_address,
            CallScheme::CallCode => input.context.caller,
        }
    }

    /// Root-frame entry used by the executor: notifies the tracer the same
    /// way nested frames do so a target that is the outermost callee still
    /// latches.
    pub fn enter_root_frame(&mut self, from: EVMAddress, to: EVMAddress) {
        self.depth = 0;
        self.tracer.on_enter(0, from, to, to);
        if self.targets.contains_key(&to) {
            self.tracer.on_target_contract_called(to);
        }
    }

    fn run_sub_interpreter(&mut self, input_bytes: Bytes, input: &CallInputs) -> (Return, Bytes) {
        let code = match self.code.get(&input.context.code_address) {
            Some(code) => code.clone(),
            // plain value transfer or unknown account: succeed with no output
            None => return (Stop, Bytes::new()),
        };
        let contract =
            Contract::new_with_context::<LatestSpec>(input_bytes, code, &input.context);
        let mut interp = Interpreter::new::<LatestSpec>(contract, EVM_CALL_GAS);

        self.depth += 1;
        self.tracer.on_enter(
            self.depth,
            input.context.caller,
            input.context.code_address,
            input.context.address,
        );
        let ret = interp.run::<InterceptingHost, LatestSpec>(self);
        self.tracer.on_exit(self.depth);
        self.depth -= 1;
        (ret, interp.return_value())
    }
}

impl Host for InterceptingHost {
    const INSPECT: bool = true;
    type DB = BenchmarkDB;

    fn step(&mut self, interp: &mut Interpreter, _is_static: bool) -> Return {
        if self.create_frames > 0 {
            return Continue;
        }
        let opcode = unsafe { *interp.instruction_pointer };
        match opcode {
            OP_JUMP => {
                // out-of-range stack reads record nothing
                if !interp.stack.data().is_empty() {
                    if let Ok(dest) = interp.stack.peek(0) {
                        self.tracer.on_jump(
                            interp.contract.address,
                            self.depth,
                            interp.program_counter(),
                            dest.low_u64() as usize,
                        );
                    }
                }
            }
            OP_JUMPI => {
                if interp.stack.data().len() >= 2 {
                    if let (Ok(dest), Ok(cond)) = (interp.stack.peek(0), interp.stack.peek(1)) {
                        self.tracer.on_jumpi(
                            interp.contract.address,
                            self.depth,
                            interp.program_counter(),
                            dest.low_u64() as usize,
                            !cond.is_zero(),
                        );
                    }
                }
            }
            _ => {}
        }
        Continue
    }

    fn step_end(&mut self, _interp: &mut Interpreter, _is_static: bool, _ret: Return) -> Return {
        Continue
    }

    fn env(&mut self) -> &mut Env {
        &mut self.env
    }

    fn load_account(&mut self, _address: H160) -> Option<(bool, bool)> {
        Some((true, true))
    }

    fn block_hash(&mut self, _number: U256) -> Option<H256> {
        Some(H256::zero())
    }

    fn balance(&mut self, address: H160) -> Option<(U256, bool)> {
        Some((
            self.state
                .balances
                .get(&address)
                .cloned()
                .unwrap_or_else(U256::zero),
            true,
        ))
    }

    fn code(&mut self, address: H160) -> Option<(Bytecode, bool)> {
        match self.code.get(&address) {
            Some(code) => Some((code.clone(), true)),
            None => Some((Bytecode::new(), true)),
        }
    }

    fn code_hash(&mut self, address: H160) -> Option<(H256, bool)> {
        match self.code.get(&address) {
            Some(code) => {
                let mut hash = [0u8; 32];
                keccak256(code.bytes(), &mut hash);
                Some((H256::from(hash), true))
            }
            None => Some((H256::zero(), true)),
        }
    }

    fn sload(&mut self, address: H160, index: U256) -> Option<(U256, bool)> {
        Some((self.state.sload(&address, &index), true))
    }

    fn sstore(
        &mut self,
        address: H160,
        index: U256,
        value: U256,
    ) -> Option<(U256, U256, U256, bool)> {
        self.state.sstore(address, index, value);
        Some((U256::zero(), U256::zero(), U256::zero(), true))
    }

    fn log(&mut self, _address: H160, _topics: Vec<H256>, _data: Bytes) {}

    fn selfdestruct(&mut self, _address: H160, _target: H160) -> Option<SelfDestructResult> {
        Some(SelfDestructResult::default())
    }

    fn create<SPEC: Spec>(
        &mut self,
        inputs: &mut CreateInputs,
    ) -> (Return, Option<H160>, Gas, Bytes) {
        // Mid-execution creations run, but never join the interception
        // table, and the tracer skips their frames (no on_enter).
        self.create_counter += 1;
        let mut seed = inputs.caller.as_bytes().to_vec();
        seed.extend_from_slice(&self.create_counter.to_be_bytes());
        let mut hash = [0u8; 32];
        keccak256(&seed, &mut hash);
        let created = H160::from_slice(&hash[12..]);

        let initcode = Bytecode::new_raw(inputs.init_code.clone()).to_analysed::<LatestSpec>();
        let contract = Contract::new::<LatestSpec>(
            Bytes::new(),
            initcode,
            created,
            inputs.caller,
            inputs.value,
        );
        let mut interp = Interpreter::new::<LatestSpec>(contract, EVM_CALL_GAS);
        self.create_frames += 1;
        let ret = interp.run::<InterceptingHost, LatestSpec>(self);
        self.create_frames -= 1;
        if ret != Return::Return {
            return (Revert, None, Gas::new(0), Bytes::new());
        }
        self.set_code(created, Bytecode::new_raw(interp.return_value()));
        (Continue, Some(created), Gas::new(0), Bytes::new())
    }

    fn call<SPEC: Spec>(&mut self, input: &mut CallInputs) -> (Return, Gas, Bytes) {
        let checked = Self::intercept_address(input);
        let mut input_bytes = input.input.clone();
        if let Some(replacement) = self.targets.get(&checked).cloned() {
            self.tracer.on_target_contract_called(checked);
            if let Some(buf) = replacement {
                input_bytes = Bytes::from(buf);
            }
        }
        let (ret, output) = self.run_sub_interpreter(input_bytes, input);
        (ret, Gas::new(0), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::fixed_address;

    fn contract_a() -> EVMAddress {
        fixed_address("00000000000000000000000000000000000000a1")
    }

    fn contract_b() -> EVMAddress {
        fixed_address("00000000000000000000000000000000000000b2")
    }

    fn caller() -> EVMAddress {
        fixed_address("00000000000000000000000000000000000000ca")
    }

    fn run_root(host: &mut InterceptingHost, contract: EVMAddress, input: Vec<u8>) -> Return {
        let code = host.code.get(&contract).expect("no code").clone();
        let call = Contract::new::<LatestSpec>(
            Bytes::from(input),
            code,
            contract,
            caller(),
            U256::zero(),
        );
        host.enter_root_frame(caller(), contract);
        let mut interp = Interpreter::new::<LatestSpec>(call, EVM_CALL_GAS);
        interp.run::<InterceptingHost, LatestSpec>(host)
    }

    // PUSH1 4, JUMP, STOP, JUMPDEST, STOP
    const JUMP_CODE: [u8; 6] = [0x60, 0x04, 0x56, 0x00, 0x5b, 0x00];

    #[test]
    fn jump_edges_are_recorded() {
        let mut host = InterceptingHost::new(Env::default());
        host.set_code(contract_a(), Bytecode::new_raw(Bytes::from(JUMP_CODE.to_vec())));
        host.tracer.start_trace();
        let ret = run_root(&mut host, contract_a(), vec![]);
        host.tracer.stop_trace();
        assert_eq!(ret, Stop);
        let path = host.tracer.path();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].contract_address, contract_a());
        assert_eq!(path[0].from_pc, 2);
        assert_eq!(path[0].dest_pc, 4);
    }

    // PUSH1 0x2a, PUSH1 0, SSTORE, STOP
    const SSTORE_CODE: [u8; 6] = [0x60, 0x2a, 0x60, 0x00, 0x55, 0x00];

    #[test]
    fn sstore_lands_in_replay_state() {
        let mut host = InterceptingHost::new(Env::default());
        host.set_code(contract_a(), Bytecode::new_raw(Bytes::from(SSTORE_CODE.to_vec())));
        let ret = run_root(&mut host, contract_a(), vec![]);
        assert_eq!(ret, Stop);
        assert_eq!(
            host.state.sload(&contract_a(), &U256::zero()),
            U256::from(42u64)
        );
    }

    // CALLDATASIZE, PUSH1 0, SSTORE, STOP: stores len(input) into slot 0
    const SIZE_PROBE_CODE: [u8; 5] = [0x36, 0x60, 0x00, 0x55, 0x00];

    // caller contract: CALL(B) with 4 bytes of memory as input
    fn call_b_code() -> Vec<u8> {
        let mut code = vec![
            0x60, 0x00, // retSize
            0x60, 0x00, // retOffset
            0x60, 0x04, // argsSize
            0x60, 0x00, // argsOffset
            0x60, 0x00, // value
            0x73, // PUSH20 <B>
        ];
        code.extend_from_slice(contract_b().as_bytes());
        code.extend_from_slice(&[
            0x61, 0xff, 0xff, // PUSH2 gas
            0xf1, // CALL
            0x00, // STOP
        ]);
        code
    }

    fn host_with_a_calling_b() -> InterceptingHost {
        let mut host = InterceptingHost::new(Env::default());
        host.set_code(contract_a(), Bytecode::new_raw(Bytes::from(call_b_code())));
        host.set_code(
            contract_b(),
            Bytecode::new_raw(Bytes::from(SIZE_PROBE_CODE.to_vec())),
        );
        host
    }

    #[test]
    fn some_target_rewrites_observed_input() {
        let mut host = host_with_a_calling_b();
        host.set_target(contract_b(), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        let ret = run_root(&mut host, contract_a(), vec![]);
        assert_eq!(ret, Stop);
        // B observed the 8-byte override, not A's 4 memory bytes
        assert_eq!(
            host.state.sload(&contract_b(), &U256::zero()),
            U256::from(8u64)
        );
    }

    #[test]
    fn none_target_passes_input_through() {
        let mut host = host_with_a_calling_b();
        host.set_target(contract_b(), None);
        let ret = run_root(&mut host, contract_a(), vec![]);
        assert_eq!(ret, Stop);
        assert_eq!(
            host.state.sload(&contract_b(), &U256::zero()),
            U256::from(4u64)
        );
    }

    #[test]
    fn unrelated_calls_are_untouched() {
        let mut host = host_with_a_calling_b();
        host.set_target(contract_a(), Some(vec![0xde, 0xad]));
        let ret = run_root(&mut host, contract_a(), vec![]);
        assert_eq!(ret, Stop);
        // B is not a target, its observed input stays A's original 4 bytes
        assert_eq!(
            host.state.sload(&contract_b(), &U256::zero()),
            U256::from(4u64)
        );
    }

    #[test]
    fn target_scoped_tracing_excludes_outer_frames() {
        let mut host = host_with_a_calling_b();
        host.set_target(contract_b(), None);
        host.tracer.set_target_contract(contract_b());
        host.tracer.start_trace();
        let ret = run_root(&mut host, contract_a(), vec![]);
        host.tracer.stop_trace();
        assert_eq!(ret, Stop);
        // every recorded edge belongs to B's subtree; the probe has no jumps
        assert!(host
            .tracer
            .path()
            .iter()
            .all(|j| j.contract_address == contract_b()));
    }

    // outer jump over a dead STOP, then the CALL(B) sequence
    fn jumping_caller_code() -> Vec<u8> {
        let mut code = vec![0x60, 0x04, 0x56, 0x00, 0x5b];
        code.extend(call_b_code());
        code
    }

    #[test]
    fn only_target_subtree_jumps_survive_scoping() {
        // A jumps in its own code before calling B; B jumps too. With B as
        // the target only B's edge is recorded.
        let mut host = InterceptingHost::new(Env::default());
        host.set_code(
            contract_a(),
            Bytecode::new_raw(Bytes::from(jumping_caller_code())),
        );
        host.set_code(contract_b(), Bytecode::new_raw(Bytes::from(JUMP_CODE.to_vec())));
        host.set_target(contract_b(), None);
        host.tracer.set_target_contract(contract_b());
        host.tracer.start_trace();
        let ret = run_root(&mut host, contract_a(), vec![]);
        host.tracer.stop_trace();
        assert_eq!(ret, Stop);
        let path = host.tracer.path();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].contract_address, contract_b());
        assert_eq!((path[0].from_pc, path[0].dest_pc), (2, 4));

        // untargeted, the same run keeps A's outer edge as well
        let mut host = InterceptingHost::new(Env::default());
        host.set_code(
            contract_a(),
            Bytecode::new_raw(Bytes::from(jumping_caller_code())),
        );
        host.set_code(contract_b(), Bytecode::new_raw(Bytes::from(JUMP_CODE.to_vec())));
        host.tracer.start_trace();
        run_root(&mut host, contract_a(), vec![]);
        host.tracer.stop_trace();
        assert_eq!(host.tracer.path().len(), 2);
    }

    #[test]
    fn overlay_then_changes_apply_in_order() {
        let mut state = ReplayState::default();
        let mut snapshot = AllContractsStorage::new();
        let mut slots = StorageMap::new();
        slots.insert(U256::zero(), U256::from(1u64));
        slots.insert(U256::one(), U256::from(9u64));
        snapshot.insert(contract_a(), slots);
        state.overlay_storage(&snapshot);

        let mut changes = StorageMap::new();
        changes.insert(U256::zero(), U256::from(2u64));
        state.apply_changes(contract_a(), &changes);

        assert_eq!(state.sload(&contract_a(), &U256::zero()), U256::from(2u64));
        assert_eq!(state.sload(&contract_a(), &U256::one()), U256::from(9u64));
    }
}
