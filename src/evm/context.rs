/// Replay execution context: the original transaction, its receipt and block
/// header, and the reconstructed prestate. Built once per replay and shared
/// read-only across all mutant executions.
use std::str::FromStr;
use std::sync::Arc;

use primitive_types::{H160, H256, U256};
use rlp::RlpStream;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1, SecretKey};
use serde_json::Value;

use crate::errors::{ReplayError, Result};
use crate::evm::prestate::{AllContractsStorage, PrestateResult};
use crate::evm::types::{keccak256, parse_hex_bytes, parse_hex_u256, EVMAddress};

/// Transaction envelope kinds we can re-derive a sender for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxEnvelope {
    Legacy,
    AccessList,
    DynamicFee,
}

#[derive(Clone, Debug)]
pub struct AccessListItem {
    pub address: EVMAddress,
    pub storage_keys: Vec<H256>,
}

/// The original transaction as fetched over RPC, with signature fields kept
/// raw so the sender can be recovered offline.
#[derive(Clone, Debug)]
pub struct TxData {
    pub hash: H256,
    pub envelope: TxEnvelope,
    pub nonce: u64,
    pub gas_price: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub gas: u64,
    pub to: Option<EVMAddress>,
    pub value: U256,
    pub input: Vec<u8>,
    pub chain_id: Option<u64>,
    pub access_list: Vec<AccessListItem>,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

impl TxData {
    pub fn from_rpc(raw: &Value) -> Result<Self> {
        let get_str = |key: &str| raw.get(key).and_then(Value::as_str);
        let hash = H256::from_str(
            get_str("hash").ok_or_else(|| ReplayError::parsing("tx without hash"))?,
        )
        .map_err(|e| ReplayError::parsing(format!("bad tx hash: {}", e)))?;
        let envelope = match get_str("type").map(parse_hex_u256).map(|v| v.low_u64()) {
            Some(1) => TxEnvelope::AccessList,
            Some(2) => TxEnvelope::DynamicFee,
            _ => TxEnvelope::Legacy,
        };
        let to = match get_str("to") {
            Some(s) if !s.is_empty() => Some(
                H160::from_str(s).map_err(|e| ReplayError::parsing(format!("bad to: {}", e)))?,
            ),
            _ => None,
        };
        let mut access_list = vec![];
        if let Some(items) = raw.get("accessList").and_then(Value::as_array) {
            for item in items {
                let address = H160::from_str(
                    item.get("address").and_then(Value::as_str).unwrap_or(""),
                )
                .map_err(|e| ReplayError::parsing(format!("bad access-list address: {}", e)))?;
                let mut storage_keys = vec![];
                if let Some(keys) = item.get("storageKeys").and_then(Value::as_array) {
                    for key in keys {
                        storage_keys.push(
                            H256::from_str(key.as_str().unwrap_or("")).map_err(|e| {
                                ReplayError::parsing(format!("bad storage key: {}", e))
                            })?,
                        );
                    }
                }
                access_list.push(AccessListItem {
                    address,
                    storage_keys,
                });
            }
        }
        Ok(Self {
            hash,
            envelope,
            nonce: get_str("nonce").map(parse_hex_u256).unwrap_or_default().low_u64(),
            gas_price: get_str("gasPrice").map(parse_hex_u256).unwrap_or_default(),
            max_fee_per_gas: get_str("maxFeePerGas").map(parse_hex_u256).unwrap_or_default(),
            max_priority_fee_per_gas: get_str("maxPriorityFeePerGas")
                .map(parse_hex_u256)
                .unwrap_or_default(),
            gas: get_str("gas").map(parse_hex_u256).unwrap_or_default().low_u64(),
            to,
            value: get_str("value").map(parse_hex_u256).unwrap_or_default(),
            input: get_str("input").map(parse_hex_bytes).unwrap_or_default(),
            chain_id: get_str("chainId").map(|s| parse_hex_u256(s).low_u64()),
            access_list,
            v: get_str("v").map(parse_hex_u256).unwrap_or_default(),
            r: get_str("r").map(parse_hex_u256).unwrap_or_default(),
            s: get_str("s").map(parse_hex_u256).unwrap_or_default(),
        })
    }

    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    /// Effective price used when re-executing: dynamic-fee transactions carry
    /// the fee cap, legacy ones the gas price.
    pub fn effective_gas_price(&self) -> U256 {
        match self.envelope {
            TxEnvelope::DynamicFee => self.max_fee_per_gas,
            _ => self.gas_price,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReceiptData {
    pub status: bool,
    pub gas_used: u64,
    pub block_number: U256,
    pub contract_address: Option<EVMAddress>,
}

impl ReceiptData {
    pub fn from_rpc(raw: &Value) -> Result<Self> {
        let get_str = |key: &str| raw.get(key).and_then(Value::as_str);
        Ok(Self {
            status: get_str("status").map(parse_hex_u256).unwrap_or_default() == U256::one(),
            gas_used: get_str("gasUsed").map(parse_hex_u256).unwrap_or_default().low_u64(),
            block_number: get_str("blockNumber").map(parse_hex_u256).unwrap_or_default(),
            contract_address: get_str("contractAddress")
                .filter(|s| !s.is_empty())
                .and_then(|s| H160::from_str(s).ok()),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockHeader {
    pub number: U256,
    pub timestamp: U256,
    pub coinbase: EVMAddress,
    pub difficulty: U256,
    pub gas_limit: U256,
    pub base_fee: U256,
}

impl BlockHeader {
    pub fn from_rpc(raw: &Value) -> Result<Self> {
        let get_str = |key: &str| raw.get(key).and_then(Value::as_str);
        Ok(Self {
            number: get_str("number").map(parse_hex_u256).unwrap_or_default(),
            timestamp: get_str("timestamp").map(parse_hex_u256).unwrap_or_default(),
            coinbase: get_str("miner")
                .and_then(|s| H160::from_str(s).ok())
                .unwrap_or_default(),
            difficulty: get_str("difficulty").map(parse_hex_u256).unwrap_or_default(),
            gas_limit: get_str("gasLimit").map(parse_hex_u256).unwrap_or_default(),
            base_fee: get_str("baseFeePerGas").map(parse_hex_u256).unwrap_or_default(),
        })
    }
}

fn append_to_field(stream: &mut RlpStream, to: &Option<EVMAddress>) {
    match to {
        Some(addr) => {
            stream.append(addr);
        }
        None => {
            stream.append_empty_data();
        }
    }
}

fn append_access_list(stream: &mut RlpStream, list: &[AccessListItem]) {
    stream.begin_list(list.len());
    for item in list {
        stream.begin_list(2);
        stream.append(&item.address);
        stream.begin_list(item.storage_keys.len());
        for key in &item.storage_keys {
            stream.append(key);
        }
    }
}

/// Signature machinery bound to one chain id: sighash construction, sender
/// recovery and offline signing.
#[derive(Clone, Debug)]
pub struct ReplaySigner {
    pub chain_id: u64,
}

impl ReplaySigner {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// The digest the sender signed over for `tx`.
    pub fn sighash(&self, tx: &TxData) -> [u8; 32] {
        let payload = match tx.envelope {
            TxEnvelope::Legacy => {
                let mut stream = RlpStream::new();
                // EIP-155 payload when v encodes a chain id, homestead otherwise
                let eip155 = tx.v >= U256::from(35u64);
                stream.begin_list(if eip155 { 9 } else { 6 });
                stream.append(&tx.nonce);
                stream.append(&tx.gas_price);
                stream.append(&tx.gas);
                append_to_field(&mut stream, &tx.to);
                stream.append(&tx.value);
                stream.append(&tx.input);
                if eip155 {
                    stream.append(&self.chain_id);
                    stream.append(&0u8);
                    stream.append(&0u8);
                }
                stream.out().to_vec()
            }
            TxEnvelope::AccessList => {
                let mut stream = RlpStream::new();
                stream.begin_list(8);
                stream.append(&self.chain_id);
                stream.append(&tx.nonce);
                stream.append(&tx.gas_price);
                stream.append(&tx.gas);
                append_to_field(&mut stream, &tx.to);
                stream.append(&tx.value);
                stream.append(&tx.input);
                append_access_list(&mut stream, &tx.access_list);
                [vec![0x01], stream.out().to_vec()].concat()
            }
            TxEnvelope::DynamicFee => {
                let mut stream = RlpStream::new();
                stream.begin_list(9);
                stream.append(&self.chain_id);
                stream.append(&tx.nonce);
                stream.append(&tx.max_priority_fee_per_gas);
                stream.append(&tx.max_fee_per_gas);
                stream.append(&tx.gas);
                append_to_field(&mut stream, &tx.to);
                stream.append(&tx.value);
                stream.append(&tx.input);
                append_access_list(&mut stream, &tx.access_list);
                [vec![0x02], stream.out().to_vec()].concat()
            }
        };
        let mut hash = [0u8; 32];
        keccak256(&payload, &mut hash);
        hash
    }

    fn recovery_id(&self, tx: &TxData) -> Result<i32> {
        let v = tx.v.low_u64();
        let recid = match tx.envelope {
            TxEnvelope::Legacy => {
                if tx.v >= U256::from(35u64) {
                    ((v - 35) % 2) as i32
                } else if v == 27 || v == 28 {
                    (v - 27) as i32
                } else {
                    return Err(ReplayError::validation(format!("bad legacy v value {}", v)));
                }
            }
            _ => {
                if v > 1 {
                    return Err(ReplayError::validation(format!("bad y-parity {}", v)));
                }
                v as i32
            }
        };
        Ok(recid)
    }

    /// Recover the sender address from the transaction signature.
    pub fn recover_sender(&self, tx: &TxData) -> Result<EVMAddress> {
        let sighash = self.sighash(tx);
        let mut compact = [0u8; 64];
        tx.r.to_big_endian(&mut compact[..32]);
        tx.s.to_big_endian(&mut compact[32..]);
        let rec_id = RecoveryId::from_i32(self.recovery_id(tx)?)
            .map_err(|e| ReplayError::validation(format!("recovery id: {}", e)))?;
        let signature = RecoverableSignature::from_compact(&compact, rec_id)
            .map_err(|e| ReplayError::validation(format!("signature: {}", e)))?;
        let message = Message::from_slice(&sighash)
            .map_err(|e| ReplayError::validation(format!("sighash: {}", e)))?;
        let pubkey = Secp256k1::new()
            .recover_ecdsa(&message, &signature)
            .map_err(|e| {
                ReplayError::validation(format!("sender recovery failed: {}", e))
                    .with_context("tx", format!("{:?}", tx.hash))
            })?;
        Ok(pubkey_to_address(&pubkey.serialize_uncompressed()))
    }

    /// Sign a dynamic-fee payload with `priv_key_hex` and return the raw
    /// broadcastable hex plus the resulting transaction hash.
    pub fn offline_sign(&self, tx: &DynamicFeeTx, priv_key_hex: &str) -> Result<(String, String)> {
        let key_bytes = hex::decode(priv_key_hex.trim_start_matches("0x"))
            .map_err(|e| ReplayError::validation(format!("bad private key hex: {}", e)))?;
        let secret = SecretKey::from_slice(&key_bytes)
            .map_err(|e| ReplayError::validation(format!("bad private key: {}", e)))?;
        let unsigned = tx.as_tx_data(self.chain_id);
        let sighash = self.sighash(&unsigned);
        let message = Message::from_slice(&sighash)
            .map_err(|e| ReplayError::validation(format!("sighash: {}", e)))?;
        let (rec_id, compact) = Secp256k1::new()
            .sign_ecdsa_recoverable(&message, &secret)
            .serialize_compact();

        let mut stream = RlpStream::new();
        stream.begin_list(12);
        stream.append(&self.chain_id);
        stream.append(&tx.nonce);
        stream.append(&tx.max_priority_fee_per_gas);
        stream.append(&tx.max_fee_per_gas);
        stream.append(&tx.gas);
        append_to_field(&mut stream, &tx.to);
        stream.append(&tx.value);
        stream.append(&tx.data);
        append_access_list(&mut stream, &[]);
        stream.append(&(rec_id.to_i32() as u64));
        stream.append(&U256::from_big_endian(&compact[..32]));
        stream.append(&U256::from_big_endian(&compact[32..]));
        let raw = [vec![0x02], stream.out().to_vec()].concat();

        let mut tx_hash = [0u8; 32];
        keccak256(&raw, &mut tx_hash);
        Ok((hex::encode(raw), hex::encode(tx_hash)))
    }
}

/// Unsigned EIP-1559 payload for the optional mutation sender.
#[derive(Clone, Debug)]
pub struct DynamicFeeTx {
    pub nonce: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas: u64,
    pub to: Option<EVMAddress>,
    pub value: U256,
    pub data: Vec<u8>,
}

impl DynamicFeeTx {
    fn as_tx_data(&self, chain_id: u64) -> TxData {
        TxData {
            hash: H256::zero(),
            envelope: TxEnvelope::DynamicFee,
            nonce: self.nonce,
            gas_price: U256::zero(),
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            gas: self.gas,
            to: self.to,
            value: self.value,
            input: self.data.clone(),
            chain_id: Some(chain_id),
            access_list: vec![],
            v: U256::zero(),
            r: U256::zero(),
            s: U256::zero(),
        }
    }
}

pub fn pubkey_to_address(uncompressed: &[u8; 65]) -> EVMAddress {
    let mut hash = [0u8; 32];
    keccak256(&uncompressed[1..], &mut hash);
    H160::from_slice(&hash[12..])
}

/// Address controlled by a raw private key, used by the mutation sender.
pub fn address_of_private_key(priv_key_hex: &str) -> Result<EVMAddress> {
    let key_bytes = hex::decode(priv_key_hex.trim_start_matches("0x"))
        .map_err(|e| ReplayError::validation(format!("bad private key hex: {}", e)))?;
    let secret = SecretKey::from_slice(&key_bytes)
        .map_err(|e| ReplayError::validation(format!("bad private key: {}", e)))?;
    let pubkey = secret.public_key(&Secp256k1::new());
    Ok(pubkey_to_address(&pubkey.serialize_uncompressed()))
}

/// Everything a mutant execution needs, owned once and shared via `Arc`.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub tx: TxData,
    pub tx_hash: H256,
    pub from: EVMAddress,
    pub receipt: ReceiptData,
    pub block_header: BlockHeader,
    pub chain_id: u64,
    pub signer: ReplaySigner,
    pub prestate: PrestateResult,
    pub all_contracts_storage: AllContractsStorage,
}

impl ExecutionContext {
    /// Build the context, recovering the sender. Recovery failure is fatal:
    /// a context with a wrong `from` would replay a different transaction.
    pub fn build(
        tx: TxData,
        receipt: ReceiptData,
        block_header: BlockHeader,
        chain_id: u64,
        prestate: PrestateResult,
        all_contracts_storage: AllContractsStorage,
    ) -> Result<Arc<Self>> {
        let signer = ReplaySigner::new(tx.chain_id.unwrap_or(chain_id));
        let from = signer.recover_sender(&tx)?;
        Ok(Arc::new(Self {
            tx_hash: tx.hash,
            from,
            receipt,
            block_header,
            chain_id,
            signer,
            prestate,
            all_contracts_storage,
            tx,
        }))
    }

    /// Target of the original transaction; the created address for deploys.
    pub fn target_contract(&self) -> Option<EVMAddress> {
        self.tx.to.or(self.receipt.contract_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn sample_dynamic_tx() -> DynamicFeeTx {
        DynamicFeeTx {
            nonce: 3,
            max_priority_fee_per_gas: U256::from(2_000_000_000u64),
            max_fee_per_gas: U256::from(30_000_000_000u64),
            gas: 120_000,
            to: Some(crate::evm::types::fixed_address(
                "1111111111111111111111111111111111111111",
            )),
            value: U256::zero(),
            data: vec![0x69, 0x8c, 0xcd, 0x3a],
        }
    }

    #[test]
    fn sign_then_recover_roundtrip() {
        let signer = ReplaySigner::new(1);
        let unsigned = sample_dynamic_tx();
        let (raw_hex, tx_hash_hex) = signer.offline_sign(&unsigned, TEST_KEY).unwrap();
        assert!(raw_hex.starts_with("02"));
        assert_eq!(tx_hash_hex.len(), 64);

        // rebuild a TxData carrying the produced signature and recover
        let raw = hex::decode(&raw_hex).unwrap();
        let decoded = rlp::Rlp::new(&raw[1..]);
        let v: u64 = decoded.val_at(9).unwrap();
        let r: U256 = decoded.val_at(10).unwrap();
        let s: U256 = decoded.val_at(11).unwrap();
        let mut tx = unsigned.as_tx_data(1);
        tx.v = U256::from(v);
        tx.r = r;
        tx.s = s;
        let sender = signer.recover_sender(&tx).unwrap();
        assert_eq!(sender, address_of_private_key(TEST_KEY).unwrap());
    }

    #[test]
    fn context_rejects_garbage_signature() {
        let mut tx = sample_dynamic_tx().as_tx_data(1);
        tx.v = U256::zero();
        tx.r = U256::zero();
        tx.s = U256::zero();
        let err = ExecutionContext::build(
            tx,
            ReceiptData::default(),
            BlockHeader::default(),
            1,
            PrestateResult::new(),
            AllContractsStorage::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Validation);
    }

    #[test]
    fn tx_json_parses() {
        let raw: Value = serde_json::from_str(
            r#"{
            "hash": "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060",
            "type": "0x2",
            "nonce": "0x1",
            "maxFeePerGas": "0x6fc23ac00",
            "maxPriorityFeePerGas": "0x77359400",
            "gas": "0x5208",
            "to": "0x1111111111111111111111111111111111111111",
            "value": "0xde0b6b3a7640000",
            "input": "0x",
            "chainId": "0x1",
            "v": "0x1",
            "r": "0x1b5e176d927f8e9ab405058b2d2457392da3e20f328b16ddabcebc33eaac5fea",
            "s": "0x4ba69724e8f69de52f0125ad8b3c5c2cef33019bac3249e2c0a2192766d1721c"
        }"#,
        )
        .unwrap();
        let tx = TxData::from_rpc(&raw).unwrap();
        assert_eq!(tx.envelope, TxEnvelope::DynamicFee);
        assert_eq!(tx.nonce, 1);
        assert!(!tx.is_create());
        assert_eq!(tx.effective_gas_price(), U256::from(0x6fc23ac00u64));
    }

    #[test]
    fn legacy_sighash_uses_eip155_when_v_carries_chain() {
        let signer = ReplaySigner::new(1);
        let mut tx = sample_dynamic_tx().as_tx_data(1);
        tx.envelope = TxEnvelope::Legacy;
        tx.gas_price = U256::from(1_000_000_000u64);
        tx.v = U256::from(37u64); // chain 1, recid 0
        let eip155 = signer.sighash(&tx);
        tx.v = U256::from(27u64);
        let homestead = signer.sighash(&tx);
        assert_ne!(eip155, homestead);
    }
}
