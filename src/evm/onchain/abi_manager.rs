/// Block-explorer ABI fetching with a two-level (memory + disk) cache.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{Cache, FileSystemCache};
use crate::errors::{ReplayError, Result};
use crate::evm::types::EVMAddress;

#[derive(Clone, Debug, Default)]
pub struct AbiCacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub remote_fetches: u64,
    pub misses: u64,
}

pub struct AbiManager {
    client: reqwest::blocking::Client,
    /// chain id -> explorer API base
    explorer_bases: RwLock<HashMap<u64, String>>,
    /// chain id -> API key
    api_keys: RwLock<HashMap<u64, String>>,
    memory: RwLock<HashMap<(u64, EVMAddress), Option<String>>>,
    disk: FileSystemCache,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    remote_fetches: AtomicU64,
    misses: AtomicU64,
}

impl AbiManager {
    pub fn new(cache_dir: &str) -> Self {
        let mut explorer_bases = HashMap::new();
        explorer_bases.insert(1, "https://api.etherscan.io/api".to_string());
        explorer_bases.insert(56, "https://api.bscscan.com/api".to_string());
        explorer_bases.insert(137, "https://api.polygonscan.com/api".to_string());
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("failed to build http client"),
            explorer_bases: RwLock::new(explorer_bases),
            api_keys: RwLock::new(HashMap::new()),
            memory: RwLock::new(HashMap::new()),
            disk: FileSystemCache::new(cache_dir),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            remote_fetches: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn set_api_key(&self, chain_id: u64, key: impl Into<String>) {
        self.api_keys.write().unwrap().insert(chain_id, key.into());
    }

    pub fn set_explorer_base(&self, chain_id: u64, base: impl Into<String>) {
        self.explorer_bases
            .write()
            .unwrap()
            .insert(chain_id, base.into());
    }

    pub fn cache_stats(&self) -> AbiCacheStats {
        AbiCacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn disk_key(chain_id: u64, address: EVMAddress) -> String {
        format!("abi_{}_{}", chain_id, hex::encode(address))
    }

    /// Fetch the verified ABI JSON for `address`, consulting memory, then
    /// disk, then the explorer. Unverified contracts are cached as absent.
    pub fn get_contract_abi(&self, chain_id: u64, address: EVMAddress) -> Result<String> {
        if let Some(cached) = self.memory.read().unwrap().get(&(chain_id, address)) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return cached
                .clone()
                .ok_or_else(|| ReplayError::not_found("contract ABI not verified"));
        }

        let key = Self::disk_key(chain_id, address);
        if let Ok(data) = self.disk.load(&key) {
            self.disk_hits.fetch_add(1, Ordering::Relaxed);
            self.memory
                .write()
                .unwrap()
                .insert((chain_id, address), Some(data.clone()));
            return Ok(data);
        }

        let fetched = self.fetch_abi_uncached(chain_id, address)?;
        self.memory
            .write()
            .unwrap()
            .insert((chain_id, address), fetched.clone());
        match fetched {
            Some(data) => {
                if let Err(e) = self.disk.save(&key, &data) {
                    warn!("failed to persist ABI for {:?}: {}", address, e);
                }
                Ok(data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(ReplayError::not_found(format!(
                    "no verified ABI for {:?} on chain {}",
                    address, chain_id
                )))
            }
        }
    }

    fn fetch_abi_uncached(
        &self,
        chain_id: u64,
        address: EVMAddress,
    ) -> Result<Option<String>> {
        let base = self
            .explorer_bases
            .read()
            .unwrap()
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| {
                ReplayError::config(format!("no explorer configured for chain {}", chain_id))
            })?;
        let api_key = self
            .api_keys
            .read()
            .unwrap()
            .get(&chain_id)
            .cloned()
            .unwrap_or_default();
        let endpoint = format!(
            "{}?module=contract&action=getabi&address=0x{:x}&format=json&apikey={}",
            base, address, api_key
        );
        debug!("fetching abi from {}", base);
        self.remote_fetches.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .client
            .get(endpoint)
            .send()
            .map_err(|e| ReplayError::network(format!("explorer request failed: {}", e)))?;
        let body = resp
            .text()
            .map_err(|e| ReplayError::network(format!("explorer body read failed: {}", e)))?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|e| ReplayError::parsing(format!("explorer returned non-json: {}", e)))?;
        match json["result"].as_str() {
            Some(result) if result == "Contract source code not verified" => Ok(None),
            Some(result) if result.starts_with("Max rate limit reached") => Err(
                ReplayError::new(crate::errors::ErrorKind::Quota, "explorer rate limit reached")
                    .recoverable(true),
            ),
            Some(result) => Ok(Some(result.to_string())),
            None => Ok(None),
        }
    }
}
