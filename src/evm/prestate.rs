/// Prestate reconstruction: the accounts and storage a transaction observed
/// at its start, fetched through the prestate-style tracer.
use std::collections::HashMap;
use std::str::FromStr;

use primitive_types::{H160, H256, U256};
use serde_json::Value;
use tracing::debug;

use crate::errors::{ReplayError, Result};
use crate::evm::onchain::endpoints::NodeClient;
use crate::evm::types::{parse_hex_bytes, parse_hex_u256, EVMAddress, EVMU256, StorageMap};

#[derive(Clone, Debug, Default)]
pub struct AccountState {
    pub balance: Option<U256>,
    pub code: Option<Vec<u8>>,
    pub nonce: Option<u64>,
    pub storage: StorageMap,
}

impl AccountState {
    pub fn has_code(&self) -> bool {
        self.code.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}

pub type PrestateResult = HashMap<EVMAddress, AccountState>;

/// Storage view across every contract the transaction touched.
pub type AllContractsStorage = HashMap<EVMAddress, StorageMap>;

pub struct PrestateOracle<'a> {
    client: &'a NodeClient,
}

impl<'a> PrestateOracle<'a> {
    pub fn new(client: &'a NodeClient) -> Self {
        Self { client }
    }

    /// Fetch the prestate for `tx_hash` plus the storage snapshot of every
    /// contract account in it.
    pub fn fetch(&self, tx_hash: H256) -> Result<(PrestateResult, AllContractsStorage)> {
        let raw = self.client.trace_prestate(tx_hash)?;
        let prestate = parse_prestate(&raw)?;
        let storage = collect_contract_storage(&prestate);
        debug!(
            "prestate for {:?}: {} accounts, {} contracts with storage",
            tx_hash,
            prestate.len(),
            storage.len()
        );
        Ok((prestate, storage))
    }
}

pub fn parse_prestate(raw: &Value) -> Result<PrestateResult> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ReplayError::parsing("prestateTracer result is not an object"))?;
    let mut result = PrestateResult::new();
    for (addr_str, account_raw) in obj {
        let addr = H160::from_str(addr_str).map_err(|e| {
            ReplayError::parsing(format!("bad prestate address {:?}: {}", addr_str, e))
        })?;
        let mut account = AccountState::default();
        if let Some(balance) = account_raw.get("balance").and_then(Value::as_str) {
            account.balance = Some(parse_hex_u256(balance));
        }
        if let Some(code) = account_raw.get("code").and_then(Value::as_str) {
            account.code = Some(parse_hex_bytes(code));
        }
        match account_raw.get("nonce") {
            Some(Value::Number(n)) => account.nonce = n.as_u64(),
            Some(Value::String(s)) => account.nonce = Some(parse_hex_u256(s).low_u64()),
            _ => {}
        }
        if let Some(storage) = account_raw.get("storage").and_then(Value::as_object) {
            for (slot, value) in storage {
                let slot = parse_hex_u256(slot);
                let value = value
                    .as_str()
                    .map(parse_hex_u256)
                    .unwrap_or_else(EVMU256::zero);
                account.storage.insert(slot, value);
            }
        }
        result.insert(addr, account);
    }
    Ok(result)
}

/// Project the per-account storage maps of contract accounts into the
/// multi-contract snapshot handed to the planner and executor.
pub fn collect_contract_storage(prestate: &PrestateResult) -> AllContractsStorage {
    prestate
        .iter()
        .filter(|(_, account)| account.has_code() || !account.storage.is_empty())
        .map(|(addr, account)| (*addr, account.storage.clone()))
        .collect()
}
