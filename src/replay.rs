/// Replay controller: the end-to-end pipeline from a transaction hash and a
/// protected contract to a scored collection of attack variants, plus the
/// optional on-chain sender for the surviving mutants.
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use primitive_types::{H256, U256};
use tracing::{debug, info, warn};

use crate::analyzer::{ContractAnalysis, StorageAnalyzer};
use crate::concurrency::ConcurrencyManager;
use crate::config::{private_key_from_env, ChainConfig, ExecutionConfig, ReplayConfig};
use crate::errors::{retry_with_backoff, ReplayError, Result};
use crate::evm::abi::ContractAbi;
use crate::evm::bytecode_analyzer::constant_words;
use crate::evm::calltrace::{CallTrace, CallTraceExtractor};
use crate::evm::context::{
    address_of_private_key, BlockHeader, DynamicFeeTx, ExecutionContext, ReceiptData,
    ReplaySigner, TxData,
};
use crate::evm::executor::ReplayExecutor;
use crate::evm::onchain::abi_manager::AbiManager;
use crate::evm::onchain::endpoints::NodeClient;
use crate::evm::prestate::PrestateOracle;
use crate::evm::types::{EVMAddress, StorageMap};
use crate::mutation::planner::MutationPlanner;
use crate::mutation::step::{StepMutationConfig, StepMutator};
use crate::mutation::type_aware::TypeAwareMutator;
use crate::mutation::{MutationCollection, MutationData, MutationResult};
use crate::r#const::{SEND_PAUSE_MS, SIMPLE_SLOT_BOUND};
use crate::strategy::StrategyManager;

/// Outcome of the optional sender: every hash that made it out, plus the
/// first error met along the way.
#[derive(Debug, Default)]
pub struct SendOutcome {
    pub sent: Vec<H256>,
    pub first_error: Option<ReplayError>,
}

pub struct ReplayController {
    pub client: NodeClient,
    pub abi_manager: Arc<AbiManager>,
    pub strategy_manager: Arc<StrategyManager>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub config: ReplayConfig,
    pub exec_config: ExecutionConfig,
    /// injected signer key; never read from a global
    private_key: Option<String>,
    protected: RwLock<HashSet<EVMAddress>>,
    type_aware_contracts: RwLock<HashSet<EVMAddress>>,
    type_aware_enabled: RwLock<bool>,
    chain_config: RwLock<Option<ChainConfig>>,
}

impl ReplayController {
    pub fn new(
        rpc_url: impl Into<String>,
        work_dir: &str,
        config: ReplayConfig,
        exec_config: ExecutionConfig,
        private_key: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        exec_config.validate()?;
        let threshold = config.similarity_threshold;
        Ok(Self {
            client: NodeClient::new(rpc_url),
            abi_manager: Arc::new(AbiManager::new(&format!("{}/abi_cache", work_dir))),
            strategy_manager: Arc::new(StrategyManager::new(threshold)),
            concurrency: Arc::new(ConcurrencyManager::default()),
            private_key: private_key.or_else(private_key_from_env),
            protected: RwLock::new(HashSet::new()),
            type_aware_contracts: RwLock::new(HashSet::new()),
            type_aware_enabled: RwLock::new(config.enable_type_aware),
            chain_config: RwLock::new(None),
            config,
            exec_config,
        })
    }

    /// Install per-chain settings: explorer endpoint, API key and the
    /// operator's known-address pool.
    pub fn set_chain_config(&self, config: ChainConfig) -> Result<()> {
        config.validate()?;
        self.abi_manager
            .set_explorer_base(config.chain_id, config.explorer_api.clone());
        if !config.explorer_api_key.is_empty() {
            self.abi_manager
                .set_api_key(config.chain_id, config.explorer_api_key.clone());
        }
        *self.chain_config.write().unwrap() = Some(config);
        Ok(())
    }

    pub fn add_protected_contract(&self, address: EVMAddress) {
        self.protected.write().unwrap().insert(address);
    }

    pub fn enable_type_aware_mutation(&self, address: EVMAddress) {
        *self.type_aware_enabled.write().unwrap() = true;
        self.type_aware_contracts.write().unwrap().insert(address);
    }

    pub fn disable_type_aware_mutation(&self) {
        *self.type_aware_enabled.write().unwrap() = false;
    }

    fn type_aware_for(&self, address: EVMAddress) -> bool {
        *self.type_aware_enabled.read().unwrap()
            && (self.type_aware_contracts.read().unwrap().contains(&address)
                || self.config.enable_type_aware)
    }

    /// The full pipeline for one historical transaction.
    pub fn replay_and_collect_mutations(
        &self,
        tx_hash: H256,
        contract_addr: EVMAddress,
    ) -> Result<MutationCollection> {
        let tx_raw = retry_with_backoff("tx fetch", || self.client.tx_by_hash(tx_hash))?;
        let tx = TxData::from_rpc(&tx_raw)?;
        let receipt_raw =
            retry_with_backoff("receipt fetch", || self.client.tx_receipt_by_hash(tx_hash))?;
        let receipt = ReceiptData::from_rpc(&receipt_raw)?;
        let header_raw = retry_with_backoff("header fetch", || {
            self.client.block_header_by_number(receipt.block_number)
        })?;
        let block_header = BlockHeader::from_rpc(&header_raw)?;
        let chain_id = match tx.chain_id {
            Some(id) => id,
            None => retry_with_backoff("network id", || self.client.network_id())?,
        };

        let mut protected = self.protected.read().unwrap().clone();
        protected.insert(contract_addr);
        let call_trace = CallTraceExtractor::new(&self.client).extract(tx_hash, protected)?;

        let (prestate, all_contracts_storage) = PrestateOracle::new(&self.client).fetch(tx_hash)?;
        let context = ExecutionContext::build(
            tx,
            receipt,
            block_header,
            chain_id,
            prestate,
            all_contracts_storage,
        )?;
        info!(
            "context ready for {:?}: sender {:?}, {} extracted calls",
            tx_hash,
            context.from,
            call_trace.extracted.len()
        );
        self.collect_with_context(context, call_trace, contract_addr)
    }

    /// Batch loop over an already-built context; split out so the pipeline
    /// is drivable without RPC.
    pub fn collect_with_context(
        &self,
        context: Arc<ExecutionContext>,
        call_trace: CallTrace,
        contract_addr: EVMAddress,
    ) -> Result<MutationCollection> {
        let chain_id = context.chain_id;
        let executor = ReplayExecutor::new(
            context.clone(),
            self.concurrency.clone(),
            self.exec_config.clone(),
        );
        // the reference run completes-before any mutant batch, on a worker
        // bounded by the configured deadline
        let reference = {
            let exec = ReplayExecutor::new(
                context.clone(),
                self.concurrency.clone(),
                self.exec_config.clone(),
            );
            let protected = call_trace.protected.clone();
            self.concurrency.execute_with_timeout(
                move || exec.execute_reference(&protected, contract_addr),
                Duration::from_secs(self.exec_config.timeout_seconds),
            )?
        };

        // the planner's view of "the" original input: the extracted
        // sub-call when one exists, the outer tx data otherwise
        let extraction = call_trace.extraction_for(contract_addr).cloned();
        let original_input: Vec<u8> = match &extraction {
            Some(call) => call.input_data.clone(),
            None => context.tx.input.clone(),
        };

        let storage: StorageMap = context
            .all_contracts_storage
            .get(&contract_addr)
            .cloned()
            .unwrap_or_default();
        let abi = self.cached_abi(chain_id, contract_addr);
        let function = abi
            .as_ref()
            .filter(|_| self.type_aware_for(contract_addr))
            .and_then(|a| a.function_for_calldata(&original_input));
        let analysis = StorageAnalyzer::analyze(contract_addr, &storage, abi.as_ref());

        let mut type_aware = TypeAwareMutator::new(chain_id);
        if let Some(chain_config) = self.chain_config.read().unwrap().as_ref() {
            if chain_config.chain_id == chain_id {
                type_aware = type_aware.with_chain_config(chain_config);
            }
        }
        let mut planner = MutationPlanner::new(
            type_aware,
            StepMutator::new(StepMutationConfig::default()),
        );
        planner.enable_type_aware = self.type_aware_for(contract_addr);
        if let Some(code) = context
            .prestate
            .get(&contract_addr)
            .and_then(|account| account.code.as_ref())
        {
            if !code.is_empty() {
                let bytecode = revm::Bytecode::new_raw(bytes::Bytes::from(code.clone()));
                planner.constant_pool = constant_words(&bytecode);
            }
        }

        let mut results: Vec<MutationResult> = vec![];
        let mut stale_rounds = 0;
        while results.len() < self.config.max_mutations {
            let snapshot = self.strategy_manager.snapshot();
            let candidates = if call_trace.has_extractions() {
                let plan = planner.build_plan(
                    contract_addr,
                    &analysis.slots,
                    original_input.len(),
                    &snapshot,
                );
                let mut generated =
                    planner.generate(&plan, &storage, Some(&original_input), function);
                if let Some(call) = &extraction {
                    for c in &mut generated {
                        c.source_call = Some(call.clone());
                    }
                }
                generated
            } else if self.config.fallback_to_generic {
                StepMutator::new(StepMutationConfig::default()).generate(
                    contract_addr,
                    Some(&original_input),
                    &storage,
                    snapshot.batch_size,
                    results.len() as u64,
                )
            } else {
                vec![]
            };

            if candidates.is_empty() {
                stale_rounds += 1;
                if stale_rounds >= 3 {
                    warn!("no further candidates for {:?}, stopping early", contract_addr);
                    break;
                }
                continue;
            }
            stale_rounds = 0;

            let room = self.config.max_mutations - results.len();
            let mut batch: Vec<_> = candidates.into_iter().take(room).collect();
            // high-priority candidates go first so early pruning sees the
            // strongest strategies before giving up on the rest
            batch.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
            debug!("executing batch of {} candidates", batch.len());
            let batch_results = executor.execute_batch(&batch, &reference);
            let _ = self
                .concurrency
                .with_write(crate::concurrency::LockRegion::Strategy, || {
                    for result in &batch_results {
                        // recording failures stay internal to the manager
                        self.strategy_manager.record_result(result);
                    }
                    Ok(())
                });
            results.extend(batch_results);
        }

        Ok(MutationCollection::from_results(
            context.tx_hash,
            contract_addr,
            results,
            self.config.similarity_threshold,
            Some(call_trace),
            context.all_contracts_storage.clone(),
        ))
    }

    fn cached_abi(&self, chain_id: u64, address: EVMAddress) -> Option<ContractAbi> {
        let fetched = self
            .concurrency
            .with_read(crate::concurrency::LockRegion::Abi, || {
                self.abi_manager.get_contract_abi(chain_id, address)
            });
        match fetched {
            Ok(raw) => match ContractAbi::parse_abi_str(&raw) {
                Ok(abi) => Some(abi),
                Err(e) => {
                    warn!("ABI for {:?} did not parse: {}", address, e);
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// Sign and broadcast mutated inputs against `contract_addr`, pausing
    /// between sends so consecutive nonces land in order. Failures are
    /// per-mutation; everything already sent is reported either way.
    pub fn send_mutation_transactions(
        &self,
        contract_addr: EVMAddress,
        mutations: &[MutationData],
        gas_limit: u64,
    ) -> SendOutcome {
        let mut outcome = SendOutcome::default();
        let key = match &self.private_key {
            Some(key) => key.clone(),
            None => {
                outcome.first_error = Some(ReplayError::config(
                    "no private key configured for sending",
                ));
                return outcome;
            }
        };
        let prepared = (|| -> Result<(ReplaySigner, u64, U256)> {
            let sender = address_of_private_key(&key)?;
            let chain_id = self.client.network_id()?;
            let nonce = self.client.tx_count_by_address(sender)?;
            let gas_price = self.client.gas_price().unwrap_or_else(|_| U256::from(30_000_000_000u64));
            Ok((ReplaySigner::new(chain_id), nonce, gas_price))
        })();
        let (signer, mut nonce, gas_price) = match prepared {
            Ok(v) => v,
            Err(e) => {
                outcome.first_error = Some(e);
                return outcome;
            }
        };

        for (i, mutation) in mutations.iter().enumerate() {
            let tx = DynamicFeeTx {
                nonce,
                max_priority_fee_per_gas: U256::from(1_500_000_000u64),
                max_fee_per_gas: gas_price * U256::from(2u64),
                gas: gas_limit,
                to: Some(contract_addr),
                value: mutation.value,
                data: mutation.input_data.clone(),
            };
            let send = signer
                .offline_sign(&tx, &key)
                .and_then(|(raw_hex, _)| self.client.send_raw_transaction(&raw_hex));
            match send {
                Ok(hash) => {
                    info!("mutation {} sent as {:?}", i, hash);
                    outcome.sent.push(hash);
                    nonce += 1;
                }
                Err(e) => {
                    warn!("mutation {} failed to send: {}", i, e);
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(e);
                    }
                }
            }
            if i + 1 < mutations.len() {
                thread::sleep(Duration::from_millis(SEND_PAUSE_MS));
            }
        }
        outcome
    }

    /// Storage-shape analysis of a live contract: the declared-slot range is
    /// read over RPC and run through the heuristics.
    pub fn analyze_contract(&self, address: EVMAddress) -> Result<ContractAnalysis> {
        let chain_id = self.client.network_id()?;
        let mut storage = StorageMap::new();
        for slot in 0..SIMPLE_SLOT_BOUND * 2 {
            let slot = U256::from(slot);
            let value = self.client.get_storage_at(address, slot)?;
            if !value.is_zero() {
                storage.insert(slot, value);
            }
        }
        let abi = self.cached_abi(chain_id, address);
        Ok(StorageAnalyzer::analyze(address, &storage, abi.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::calltrace::{build_call_trace, CallFrame};
    use crate::evm::context::{ReceiptData, TxEnvelope};
    use crate::evm::prestate::{AccountState, AllContractsStorage, PrestateResult};
    use crate::evm::types::fixed_address;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn contract() -> EVMAddress {
        fixed_address("1111111111111111111111111111111111111111")
    }

    fn controller() -> ReplayController {
        ReplayController::new(
            "http://127.0.0.1:18545",
            std::env::temp_dir().join("txshield_replay_test").to_str().unwrap(),
            ReplayConfig::default(),
            ExecutionConfig::default(),
            Some(TEST_KEY.to_string()),
        )
        .unwrap()
    }

    // SLOAD slot0, PUSH1 8, JUMPI, STOP, STOP, JUMPDEST, STOP
    const BRANCH_ON_SLOT0: [u8; 10] =
        [0x60, 0x00, 0x54, 0x60, 0x08, 0x57, 0x00, 0x00, 0x5b, 0x00];

    fn signed_context() -> Arc<ExecutionContext> {
        let signer = ReplaySigner::new(1);
        let unsigned = DynamicFeeTx {
            nonce: 0,
            max_priority_fee_per_gas: U256::one(),
            max_fee_per_gas: U256::from(100u64),
            gas: 1_000_000,
            to: Some(contract()),
            value: U256::zero(),
            data: [vec![0xaa, 0xbb, 0xcc, 0xdd], vec![7u8; 32]].concat(),
        };
        let (raw_hex, _) = signer.offline_sign(&unsigned, TEST_KEY).unwrap();
        let raw = hex::decode(raw_hex).unwrap();
        let decoded = rlp::Rlp::new(&raw[1..]);
        let tx = TxData {
            hash: H256::repeat_byte(0x77),
            envelope: TxEnvelope::DynamicFee,
            nonce: 0,
            gas_price: U256::zero(),
            max_fee_per_gas: U256::from(100u64),
            max_priority_fee_per_gas: U256::one(),
            gas: 1_000_000,
            to: Some(contract()),
            value: U256::zero(),
            input: [vec![0xaa, 0xbb, 0xcc, 0xdd], vec![7u8; 32]].concat(),
            chain_id: Some(1),
            access_list: vec![],
            v: U256::from(decoded.val_at::<u64>(9).unwrap()),
            r: decoded.val_at(10).unwrap(),
            s: decoded.val_at(11).unwrap(),
        };
        let mut prestate = PrestateResult::new();
        let mut account = AccountState::default();
        account.code = Some(BRANCH_ON_SLOT0.to_vec());
        account.storage.insert(U256::zero(), U256::one());
        account.storage.insert(U256::one(), U256::exp10(18));
        prestate.insert(contract(), account);
        let storage: AllContractsStorage = prestate
            .iter()
            .map(|(a, acc)| (*a, acc.storage.clone()))
            .collect();
        ExecutionContext::build(
            tx,
            ReceiptData::default(),
            BlockHeader::default(),
            1,
            prestate,
            storage,
        )
        .unwrap()
    }

    fn trace_with_extraction(ctx: &ExecutionContext) -> CallTrace {
        let root = CallFrame {
            call_type: "CALL".to_string(),
            from: format!("0x{:x}", ctx.from),
            to: format!("0x{:x}", contract()),
            input: format!("0x{}", hex::encode(&ctx.tx.input)),
            gas: "0xf4240".to_string(),
            gas_used: "0x5208".to_string(),
            value: "0x0".to_string(),
            output: None,
            error: None,
            calls: vec![],
        };
        let mut protected = HashSet::new();
        protected.insert(contract());
        build_call_trace(ctx.tx_hash, root, protected)
    }

    #[test]
    fn chain_config_feeds_abi_manager() {
        let c = controller();
        let mut cfg = ChainConfig::new(56, "https://api.bscscan.com/api");
        cfg.explorer_api_key = "key".to_string();
        cfg.known_addresses = vec![fixed_address("00000000000000000000000000000000000000cc")];
        c.set_chain_config(cfg).unwrap();
        assert!(c.chain_config.read().unwrap().is_some());
        // invalid configs are rejected before being installed
        let bad = ChainConfig::new(0, "https://x.invalid/api");
        assert!(c.set_chain_config(bad).is_err());
    }

    #[test]
    fn type_aware_toggles() {
        let c = controller();
        assert!(c.type_aware_for(contract()));
        c.disable_type_aware_mutation();
        assert!(!c.type_aware_for(contract()));
        c.enable_type_aware_mutation(contract());
        assert!(c.type_aware_for(contract()));
    }

    #[test]
    fn end_to_end_collection_without_rpc() {
        let c = controller();
        let ctx = signed_context();
        let trace = trace_with_extraction(&ctx);
        let collection = c
            .collect_with_context(ctx.clone(), trace, contract())
            .unwrap();
        assert!(collection.stats.total_mutations > 0);
        assert!(collection.stats.total_mutations <= c.config.max_mutations);
        assert_eq!(
            collection.stats.success_count + collection.stats.failure_count,
            collection.stats.total_mutations
        );
        assert_eq!(collection.successful.len(), collection.stats.success_count);
        // every recorded result fed the strategy manager
        assert_eq!(
            c.strategy_manager.total_recorded(),
            collection.stats.total_mutations as u64
        );
        // candidates out of a call-based run carry their source call
        assert!(collection
            .results
            .iter()
            .all(|r| r.candidate.source_call.is_some()));
    }

    #[test]
    fn fallback_collection_without_extractions() {
        let c = controller();
        let ctx = signed_context();
        // trace whose root is not protected and has no matching sub-calls
        let root = CallFrame {
            call_type: "CALL".to_string(),
            from: format!("0x{:x}", ctx.from),
            to: "0x00000000000000000000000000000000000000ee".to_string(),
            input: "0x01".to_string(),
            gas: "0x0".to_string(),
            gas_used: "0x0".to_string(),
            value: "0x0".to_string(),
            output: None,
            error: None,
            calls: vec![],
        };
        let mut protected = HashSet::new();
        protected.insert(contract());
        let trace = build_call_trace(ctx.tx_hash, root, protected);
        let collection = c.collect_with_context(ctx, trace, contract()).unwrap();
        assert!(collection.stats.total_mutations > 0);
        assert!(collection
            .results
            .iter()
            .all(|r| r.candidate.source_call.is_none()));
    }

    #[test]
    fn send_without_key_is_config_error() {
        let c = ReplayController::new(
            "http://127.0.0.1:18545",
            std::env::temp_dir().join("txshield_replay_test2").to_str().unwrap(),
            ReplayConfig::default(),
            ExecutionConfig::default(),
            None,
        )
        .unwrap();
        // the env fallback may be set in CI shells; only assert when absent
        if crate::config::private_key_from_env().is_none() {
            let outcome = c.send_mutation_transactions(contract(), &[], 100_000);
            assert!(outcome.sent.is_empty());
            assert_eq!(
                outcome.first_error.unwrap().kind,
                crate::errors::ErrorKind::Config
            );
        }
    }
}
