use std::fmt::Debug;
use std::str::FromStr;

use primitive_types::{H256, U256};
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{ReplayError, Result};
use crate::evm::types::{parse_hex_u256, EVMAddress};

#[derive(Clone, Debug, Hash, PartialEq, Eq, Copy)]
pub enum Chain {
    ETH,
    BSC,
    POLYGON,
    LOCAL,
}

impl Chain {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ETH" => Some(Self::ETH),
            "BSC" => Some(Self::BSC),
            "POLYGON" => Some(Self::POLYGON),
            "LOCAL" => Some(Self::LOCAL),
            _ => None,
        }
    }

    pub fn get_chain_id(&self) -> u64 {
        match self {
            Chain::ETH => 1,
            Chain::BSC => 56,
            Chain::POLYGON => 137,
            Chain::LOCAL => 31337,
        }
    }

    pub fn get_chain_rpc(&self) -> String {
        match self {
            Chain::ETH => "https://eth.llamarpc.com",
            Chain::BSC => "https://bsc-dataseed.binance.org/",
            Chain::POLYGON => "https://polygon-rpc.com/",
            Chain::LOCAL => "http://127.0.0.1:8545",
        }
        .to_string()
    }

    pub fn get_explorer_api(&self) -> String {
        match self {
            Chain::ETH => "https://api.etherscan.io/api",
            Chain::BSC => "https://api.bscscan.com/api",
            Chain::POLYGON => "https://api.polygonscan.com/api",
            Chain::LOCAL => "",
        }
        .to_string()
    }
}

/// JSON-RPC client for the replay pipeline. The node must expose the
/// `debug_traceTransaction` tracers; there is no fallback path.
#[derive(Clone, Debug)]
pub struct NodeClient {
    pub endpoint_url: String,
    pub client: reqwest::blocking::Client,
    request_id: u64,
}

impl NodeClient {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            client: reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build http client"),
            request_id: 1,
        }
    }

    pub fn for_chain(chain: Chain) -> Self {
        Self::new(chain.get_chain_rpc())
    }

    fn request(&self, method: &str, params: Value) -> Result<Value> {
        let data = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id,
        });
        debug!("rpc {} -> {}", method, self.endpoint_url);
        let resp = self
            .client
            .post(self.endpoint_url.clone())
            .json(&data)
            .send()
            .map_err(|e| {
                ReplayError::network(format!("rpc {} failed: {}", method, e))
                    .with_context("endpoint", self.endpoint_url.clone())
            })?;
        let body: Value = resp.json().map_err(|e| {
            ReplayError::parsing(format!("rpc {} returned malformed json: {}", method, e))
        })?;
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                // propagate the node's error text verbatim
                return Err(ReplayError::api(format!("rpc {}: {}", method, err))
                    .with_context("method", method.to_string()));
            }
        }
        match body.get("result") {
            Some(result) if !result.is_null() => Ok(result.clone()),
            _ => Err(ReplayError::not_found(format!("rpc {}: empty result", method))),
        }
    }

    pub fn tx_by_hash(&self, tx_hash: H256) -> Result<Value> {
        self.request("eth_getTransactionByHash", json!([format!("{:?}", tx_hash)]))
    }

    pub fn tx_receipt_by_hash(&self, tx_hash: H256) -> Result<Value> {
        self.request(
            "eth_getTransactionReceipt",
            json!([format!("{:?}", tx_hash)]),
        )
    }

    pub fn block_header_by_number(&self, number: U256) -> Result<Value> {
        self.request(
            "eth_getBlockByNumber",
            json!([format!("0x{:x}", number), false]),
        )
    }

    pub fn network_id(&self) -> Result<u64> {
        let v = self.request("net_version", json!([]))?;
        let raw = v
            .as_str()
            .ok_or_else(|| ReplayError::parsing("net_version is not a string"))?;
        raw.parse::<u64>()
            .map_err(|e| ReplayError::parsing(format!("net_version {:?}: {}", raw, e)))
    }

    pub fn tx_count_by_address(&self, address: EVMAddress) -> Result<u64> {
        let v = self.request(
            "eth_getTransactionCount",
            json!([format!("0x{:x}", address), "latest"]),
        )?;
        let raw = v
            .as_str()
            .ok_or_else(|| ReplayError::parsing("eth_getTransactionCount is not a string"))?;
        Ok(parse_hex_u256(raw).as_u64())
    }

    pub fn send_raw_transaction(&self, raw_hex: &str) -> Result<H256> {
        let payload = if raw_hex.starts_with("0x") {
            raw_hex.to_string()
        } else {
            format!("0x{}", raw_hex)
        };
        let v = self.request("eth_sendRawTransaction", json!([payload]))?;
        let raw = v
            .as_str()
            .ok_or_else(|| ReplayError::parsing("eth_sendRawTransaction returned non-string"))?;
        H256::from_str(raw)
            .map_err(|e| ReplayError::parsing(format!("bad tx hash {:?}: {}", raw, e)))
    }

    /// `debug_traceTransaction` with the call-style tracer; the recursive
    /// call frame tree as raw JSON.
    pub fn trace_call_tree(&self, tx_hash: H256) -> Result<Value> {
        self.request(
            "debug_traceTransaction",
            json!([format!("{:?}", tx_hash), { "tracer": "callTracer" }]),
        )
    }

    /// `debug_traceTransaction` with the prestate-style tracer; accounts and
    /// storage as seen at the start of the transaction.
    pub fn trace_prestate(&self, tx_hash: H256) -> Result<Value> {
        self.request(
            "debug_traceTransaction",
            json!([format!("{:?}", tx_hash), { "tracer": "prestateTracer" }]),
        )
    }

    /// Optional opcode-level trace via the default struct logger. The
    /// returned opcode names feed the same prefix-positional similarity as
    /// execution paths.
    pub fn trace_opcodes(&self, tx_hash: H256) -> Result<Vec<String>> {
        let raw = self.request(
            "debug_traceTransaction",
            json!([format!("{:?}", tx_hash), { "disableStorage": true, "disableMemory": true, "disableStack": true }]),
        )?;
        parse_struct_log_ops(&raw)
    }

    pub fn get_balance(&self, address: EVMAddress) -> Result<U256> {
        let v = self.request(
            "eth_getBalance",
            json!([format!("0x{:x}", address), "latest"]),
        )?;
        Ok(parse_hex_u256(v.as_str().unwrap_or("0x0")))
    }

    pub fn get_storage_at(&self, address: EVMAddress, slot: U256) -> Result<U256> {
        let v = self.request(
            "eth_getStorageAt",
            json!([format!("0x{:x}", address), format!("0x{:x}", slot), "latest"]),
        )?;
        Ok(parse_hex_u256(v.as_str().unwrap_or("0x0")))
    }

    pub fn gas_price(&self) -> Result<U256> {
        let v = self.request("eth_gasPrice", json!([]))?;
        Ok(parse_hex_u256(v.as_str().unwrap_or("0x0")))
    }

    pub fn get_code(&self, address: EVMAddress) -> Result<Vec<u8>> {
        let v = self.request("eth_getCode", json!([format!("0x{:x}", address), "latest"]))?;
        let raw = v
            .as_str()
            .ok_or_else(|| ReplayError::parsing("eth_getCode returned non-string"))?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| ReplayError::decoding(format!("eth_getCode: {}", e)))
    }
}

/// Pull the opcode column out of a struct-logger trace.
pub fn parse_struct_log_ops(raw: &Value) -> Result<Vec<String>> {
    let logs = raw
        .get("structLogs")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplayError::parsing("trace result has no structLogs"))?;
    Ok(logs
        .iter()
        .filter_map(|entry| entry.get("op").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn struct_logs_become_opcode_strings() {
        let raw = json!({
            "gas": 21000,
            "structLogs": [
                {"pc": 0, "op": "PUSH1", "depth": 1},
                {"pc": 2, "op": "JUMP", "depth": 1},
                {"pc": 4, "op": "JUMPDEST", "depth": 1}
            ]
        });
        let ops = parse_struct_log_ops(&raw).unwrap();
        assert_eq!(ops, vec!["PUSH1", "JUMP", "JUMPDEST"]);
        assert!(parse_struct_log_ops(&json!({})).is_err());
    }

    #[test]
    fn chain_ids() {
        assert_eq!(Chain::ETH.get_chain_id(), 1);
        assert_eq!(Chain::BSC.get_chain_id(), 56);
        assert_eq!(Chain::from_str("BSC"), Some(Chain::BSC));
        assert_eq!(Chain::from_str("SOLANA"), None);
    }

    #[cfg(feature = "live_rpc_tests")]
    #[test]
    fn test_network_id() {
        let client = NodeClient::for_chain(Chain::BSC);
        let id = client.network_id().unwrap();
        assert_eq!(id, 56);
    }

    #[cfg(feature = "live_rpc_tests")]
    #[test]
    fn test_tx_count() {
        let client = NodeClient::for_chain(Chain::BSC);
        let v = client
            .tx_count_by_address(crate::evm::types::fixed_address(
                "10ed43c718714eb63d5aa57b78b54704e256024e",
            ))
            .unwrap();
        println!("{:?}", v)
    }
}
