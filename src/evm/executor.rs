/// Replay execution: run the original transaction for the reference path,
/// then fan mutation candidates out over workers, each against a fresh EVM
/// state derived from the shared context.
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use primitive_types::U256;
use revm::{Contract, CreateScheme, Env, Interpreter, LatestSpec, Return, TransactTo};
use tracing::{debug, warn};

use crate::concurrency::{panic_message, CancelToken, ConcurrencyManager, WorkerPool};
use crate::config::ExecutionConfig;
use crate::errors::{ReplayError, Result};
use crate::evm::context::ExecutionContext;
use crate::evm::host::{InterceptingHost, ReplayState, TargetOverrides};
use crate::evm::tracer::{path_similarity, ExecutionPath};
use crate::evm::types::EVMAddress;
use crate::mutation::{MutationCandidate, MutationResult};
use crate::r#const::EVM_CALL_GAS;

/// Raw outcome of one EVM run.
#[derive(Clone, Debug)]
pub struct RawExecution {
    pub ret: Return,
    pub output: Vec<u8>,
    pub path: ExecutionPath,
    pub gas_used: u64,
}

impl RawExecution {
    pub fn succeeded(&self) -> bool {
        matches!(self.ret, Return::Return | Return::Stop)
    }
}

pub struct ReplayExecutor {
    pub context: Arc<ExecutionContext>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub config: ExecutionConfig,
}

impl ReplayExecutor {
    pub fn new(
        context: Arc<ExecutionContext>,
        concurrency: Arc<ConcurrencyManager>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            context,
            concurrency,
            config,
        }
    }

    fn build_env(ctx: &ExecutionContext) -> Env {
        let mut env = Env::default();
        env.cfg.chain_id = U256::from(ctx.chain_id);
        env.block.number = ctx.block_header.number;
        env.block.timestamp = ctx.block_header.timestamp;
        env.block.coinbase = ctx.block_header.coinbase;
        env.block.difficulty = ctx.block_header.difficulty;
        env.block.gas_limit = ctx.block_header.gas_limit;
        env.block.basefee = ctx.block_header.base_fee;
        env.tx.caller = ctx.from;
        env.tx.gas_limit = ctx.tx.gas;
        env.tx.gas_price = ctx.tx.effective_gas_price();
        env.tx.value = ctx.tx.value;
        env.tx.transact_to = match ctx.tx.to {
            Some(to) => TransactTo::Call(to),
            None => TransactTo::Create(CreateScheme::Create),
        };
        env
    }

    /// A host whose state is a fresh copy of the prestate with the
    /// multi-contract snapshot layered on top.
    fn build_host(ctx: &ExecutionContext, targets: TargetOverrides) -> InterceptingHost {
        let mut host = InterceptingHost::new(Self::build_env(ctx));
        host.state = ReplayState::from_prestate(&ctx.prestate);
        host.state.overlay_storage(&ctx.all_contracts_storage);
        host.load_prestate_code(&ctx.prestate);
        host.targets = targets;
        host
    }

    fn run_root(
        ctx: &ExecutionContext,
        host: &mut InterceptingHost,
        input: Vec<u8>,
        tracer_target: Option<EVMAddress>,
    ) -> RawExecution {
        if let Some(target) = tracer_target {
            host.tracer.set_target_contract(target);
        }
        host.tracer.start_trace();

        let outcome = match ctx.tx.to {
            Some(to) => Self::run_call(ctx, host, to, input),
            // deployment transactions replay their constructor; jump edges
            // of create frames stay unrecorded
            None => Self::run_create(ctx, host, input),
        };

        host.tracer.stop_trace();
        let path = host.tracer.take_path();
        RawExecution {
            ret: outcome.0,
            output: outcome.1,
            gas_used: outcome.2,
            path,
        }
    }

    fn run_call(
        ctx: &ExecutionContext,
        host: &mut InterceptingHost,
        to: EVMAddress,
        input: Vec<u8>,
    ) -> (Return, Vec<u8>, u64) {
        let code = match host.code.get(&to) {
            Some(code) => code.clone(),
            // no code at the destination: a plain transfer succeeds trivially
            None => return (Return::Stop, vec![], 0),
        };
        let call = Contract::new::<LatestSpec>(
            Bytes::from(input),
            code,
            to,
            ctx.from,
            ctx.tx.value,
        );
        host.enter_root_frame(ctx.from, to);
        let mut interp = Interpreter::new::<LatestSpec>(call, EVM_CALL_GAS);
        let ret = interp.run::<InterceptingHost, LatestSpec>(host);
        host.tracer.on_exit(0);
        (ret, interp.return_value().to_vec(), interp.gas.spend())
    }

    fn run_create(
        ctx: &ExecutionContext,
        host: &mut InterceptingHost,
        initcode: Vec<u8>,
    ) -> (Return, Vec<u8>, u64) {
        let created = ctx
            .receipt
            .contract_address
            .unwrap_or_else(EVMAddress::zero);
        let code = revm::Bytecode::new_raw(Bytes::from(initcode)).to_analysed::<LatestSpec>();
        let deployer = Contract::new::<LatestSpec>(
            Bytes::new(),
            code,
            created,
            ctx.from,
            ctx.tx.value,
        );
        let mut interp = Interpreter::new::<LatestSpec>(deployer, EVM_CALL_GAS);
        let ret = interp.run::<InterceptingHost, LatestSpec>(host);
        if ret == Return::Return {
            host.set_code(created, revm::Bytecode::new_raw(interp.return_value()));
        }
        (ret, interp.return_value().to_vec(), interp.gas.spend())
    }

    /// Replay the original transaction with every protected contract in
    /// notify-only mode and return the target-scoped reference path.
    pub fn execute_reference(
        &self,
        protected: &HashSet<EVMAddress>,
        target: EVMAddress,
    ) -> Result<ExecutionPath> {
        let ctx = &self.context;
        let mut targets = TargetOverrides::new();
        for addr in protected {
            targets.insert(*addr, None);
        }
        let mut host = Self::build_host(ctx, targets);
        let raw = Self::run_root(ctx, &mut host, ctx.tx.input.clone(), Some(target));
        if !raw.succeeded() {
            // the original attack transaction succeeded on chain; a failed
            // replay means the reconstructed prestate is unusable
            return Err(ReplayError::execution(format!(
                "reference replay ended with {:?}",
                raw.ret
            ))
            .with_context("tx", format!("{:?}", ctx.tx_hash))
            .recoverable(false));
        }
        debug!("reference path: {} jumps", raw.path.len());
        Ok(raw.path)
    }

    /// Execute one candidate against a fresh state copy.
    pub fn execute_candidate(
        &self,
        candidate: &MutationCandidate,
        reference: &ExecutionPath,
    ) -> MutationResult {
        let started = Instant::now();
        let ctx = &self.context;
        let target = candidate
            .source_call
            .as_ref()
            .map(|c| c.contract_address)
            .or_else(|| ctx.target_contract())
            .unwrap_or_else(EVMAddress::zero);

        let mut targets = TargetOverrides::new();
        let root_input = if candidate.source_call.is_some() {
            // inner-call mutation: original outer calldata, override applied
            // when the protected sub-call is reached
            targets.insert(target, candidate.input_data.clone());
            ctx.tx.input.clone()
        } else {
            targets.insert(target, None);
            candidate
                .input_data
                .clone()
                .unwrap_or_else(|| ctx.tx.input.clone())
        };

        let mut host = Self::build_host(ctx, targets);
        host.state.apply_changes(target, &candidate.storage_changes);

        let raw = Self::run_root(ctx, &mut host, root_input, Some(target));
        let similarity = path_similarity(&raw.path, reference);
        MutationResult {
            candidate: candidate.clone(),
            similarity,
            success: raw.succeeded(),
            error: if raw.succeeded() {
                None
            } else {
                Some(format!("execution ended with {:?}", raw.ret))
            },
            execution_path: raw.path,
            gas_used: raw.gas_used,
            duration: started.elapsed(),
        }
    }

    fn failed_result(
        candidate: &MutationCandidate,
        started: Instant,
        message: String,
    ) -> MutationResult {
        MutationResult {
            candidate: candidate.clone(),
            similarity: 0.0,
            success: false,
            error: Some(message),
            execution_path: vec![],
            gas_used: 0,
            duration: started.elapsed(),
        }
    }

    /// Run a batch in parallel. Results come back in candidate order; a
    /// panicking or failing mutant becomes an error-carrying result and
    /// never fails the batch.
    pub fn execute_batch(
        &self,
        candidates: &[MutationCandidate],
        reference: &ExecutionPath,
    ) -> Vec<MutationResult> {
        if candidates.is_empty() {
            return vec![];
        }
        #[cfg(feature = "sequential_exec")]
        {
            return candidates
                .iter()
                .map(|c| self.execute_candidate(c, reference))
                .collect();
        }
        #[cfg(not(feature = "sequential_exec"))]
        {
            self.execute_batch_parallel(candidates, reference)
        }
    }

    #[cfg_attr(feature = "sequential_exec", allow(dead_code))]
    fn execute_batch_parallel(
        &self,
        candidates: &[MutationCandidate],
        reference: &ExecutionPath,
    ) -> Vec<MutationResult> {
        let reference = Arc::new(reference.clone());
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let cancel = CancelToken::new();
        // raised once enough high-similarity variants landed; pending
        // candidates then return pruned results instead of executing
        let prune = CancelToken::new();

        let mut pool: WorkerPool<MutationResult> =
            WorkerPool::new(self.config.max_concurrent_workers);
        pool.start();

        for (idx, candidate) in candidates.iter().enumerate() {
            let candidate_id = candidate.id;
            let candidate = candidate.clone();
            let reference = reference.clone();
            let context = self.context.clone();
            let concurrency = self.concurrency.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            let prune = prune.clone();
            let submitted = pool.submit(idx, move || {
                let started = Instant::now();
                if prune.is_cancelled() {
                    return Self::failed_result(
                        &candidate,
                        started,
                        "pruned: batch already collected enough variants".to_string(),
                    );
                }
                let executor = ReplayExecutor::new(context, concurrency, config);
                let _permit = match executor
                    .concurrency
                    .acquire_permit(timeout, &cancel)
                {
                    Ok(permit) => permit,
                    Err(e) => return Self::failed_result(&candidate, started, e.to_string()),
                };
                match panic::catch_unwind(AssertUnwindSafe(|| {
                    executor.execute_candidate(&candidate, &reference)
                })) {
                    Ok(result) => result,
                    Err(payload) => Self::failed_result(
                        &candidate,
                        started,
                        format!("mutant execution panicked: {}", panic_message(&payload)),
                    ),
                }
            });
            if let Err(e) = submitted {
                warn!("failed to submit candidate {}: {}", candidate_id, e);
            }
        }

        // workers write into slots keyed by submission index, so the batch
        // comes back in candidate order regardless of completion order
        let mut slots: Vec<Option<MutationResult>> = (0..candidates.len()).map(|_| None).collect();
        let prune_target = (candidates.len() / 2).max(1);
        let mut high_similarity = 0usize;
        let deadline = timeout + Duration::from_secs(5);
        for _ in 0..candidates.len() {
            match pool.recv_result(deadline) {
                Ok((idx, result)) => {
                    if self.config.enable_early_pruning
                        && result.is_variant(self.config.similarity_threshold)
                    {
                        high_similarity += 1;
                        if high_similarity >= prune_target {
                            prune.cancel();
                        }
                    }
                    slots[idx] = Some(result);
                }
                Err(e) => {
                    warn!("batch result wait ended early: {}", e);
                    break;
                }
            }
        }
        pool.stop();

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    Self::failed_result(
                        &candidates[idx],
                        Instant::now(),
                        "no result delivered within deadline".to_string(),
                    )
                })
            })
            .collect()
    }
}
