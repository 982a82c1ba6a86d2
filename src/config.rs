/// Configuration for the replay and mutation engine
use std::collections::HashSet;
use std::env;

use crate::errors::{ReplayError, Result};
use crate::evm::types::EVMAddress;
use crate::r#const::{DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TOTAL_MUTATIONS};

pub const PRIVATE_KEY_ENV: &str = "AUTOPATCH_PRIVATE_KEY";
pub const ETHERSCAN_KEY_ENV: &str = "ETHERSCAN_API_KEY";
pub const BSCSCAN_KEY_ENV: &str = "BSCSCAN_API_KEY";

/// Global mutation engine switches
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub enable_type_aware: bool,
    pub fallback_to_generic: bool,
    pub max_mutations: usize,
    pub similarity_threshold: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enable_type_aware: true,
            fallback_to_generic: true,
            max_mutations: DEFAULT_TOTAL_MUTATIONS,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_mutations == 0 {
            return Err(ReplayError::config("max_mutations must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ReplayError::config(format!(
                "similarity_threshold must be in [0,1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Per-chain settings: explorer endpoint and the known-address pool used by
/// address mutation strategies.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub explorer_api: String,
    pub explorer_api_key: String,
    pub known_addresses: Vec<EVMAddress>,
    pub enable_type_aware: bool,
}

impl ChainConfig {
    pub fn new(chain_id: u64, explorer_api: impl Into<String>) -> Self {
        let explorer_api = explorer_api.into();
        let explorer_api_key = match chain_id {
            56 => env::var(BSCSCAN_KEY_ENV).unwrap_or_default(),
            _ => env::var(ETHERSCAN_KEY_ENV).unwrap_or_default(),
        };
        Self {
            chain_id,
            explorer_api,
            explorer_api_key,
            known_addresses: vec![],
            enable_type_aware: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_id == 0 {
            return Err(ReplayError::config("chain_id must be > 0"));
        }
        if !self.explorer_api.starts_with("http://") && !self.explorer_api.starts_with("https://") {
            return Err(ReplayError::config(format!(
                "explorer_api is not a URL: {}",
                self.explorer_api
            )));
        }
        let mut seen = HashSet::new();
        for addr in &self.known_addresses {
            if !seen.insert(addr) {
                return Err(ReplayError::config(format!(
                    "duplicate known address {:?}",
                    addr
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AddressMutationConfig {
    pub use_known: bool,
    pub flip_bytes: Vec<usize>,
    pub nearby_range: u64,
    pub zero_ratio: f64,
}

impl Default for AddressMutationConfig {
    fn default() -> Self {
        Self {
            use_known: true,
            flip_bytes: vec![1, 2, 3],
            nearby_range: 1000,
            zero_ratio: 0.1,
        }
    }
}

impl AddressMutationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flip_bytes.iter().any(|&n| n == 0 || n > 20) {
            return Err(ReplayError::config("flip_bytes entries must be in [1,20]"));
        }
        if !(0.0..=1.0).contains(&self.zero_ratio) {
            return Err(ReplayError::config("zero_ratio must be in [0,1]"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NumberMutationConfig {
    pub boundary_values: Vec<u64>,
    pub step_sizes: Vec<i64>,
    pub multiplier_ratio: Vec<u64>,
    pub bit_patterns: Vec<u64>,
}

impl Default for NumberMutationConfig {
    fn default() -> Self {
        Self {
            boundary_values: vec![0, 1, 255, 65535, u32::MAX as u64],
            step_sizes: vec![1, 10, 100, 1000, -1, -10, -100, -1000],
            multiplier_ratio: vec![2, 10, 0],
            bit_patterns: vec![0xFFFFFFFF, 0xAAAAAAAA, 0x55555555],
        }
    }
}

#[derive(Clone, Debug)]
pub struct StringMutationConfig {
    pub max_length: usize,
    pub special_chars: Vec<char>,
    pub encoding_tests: bool,
    pub truncation: bool,
}

impl Default for StringMutationConfig {
    fn default() -> Self {
        Self {
            max_length: 1000,
            special_chars: vec![
                '\0', '\n', '\r', '\t', '"', '\'', '\\', '%', '&', '<', '>',
            ],
            encoding_tests: true,
            truncation: true,
        }
    }
}

/// Batch execution knobs
#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    pub max_concurrent_workers: usize,
    pub batch_size: usize,
    pub timeout_seconds: u64,
    pub similarity_threshold: f64,
    pub enable_early_pruning: bool,
    pub cache_size: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: crate::r#const::DEFAULT_POOL_WORKERS,
            batch_size: crate::r#const::INITIAL_BATCH_SIZE,
            timeout_seconds: 30,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            enable_early_pruning: false,
            cache_size: 1024,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workers == 0 {
            return Err(ReplayError::config("max_concurrent_workers must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ReplayError::config("batch_size must be > 0"));
        }
        if self.timeout_seconds == 0 {
            return Err(ReplayError::config("timeout_seconds must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ReplayError::config("similarity_threshold must be in [0,1]"));
        }
        Ok(())
    }
}

/// Read the replay signer key from the environment, if configured
pub fn private_key_from_env() -> Option<String> {
    env::var(PRIVATE_KEY_ENV).ok().filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::fixed_address;

    #[test]
    fn default_configs_validate() {
        ReplayConfig::default().validate().unwrap();
        AddressMutationConfig::default().validate().unwrap();
        ExecutionConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_threshold_rejected() {
        let mut cfg = ReplayConfig::default();
        cfg.similarity_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_known_address_rejected() {
        let mut cfg = ChainConfig::new(1, "https://api.etherscan.io/api");
        let a = fixed_address("8b21e662154b4bbc1ec0754d0238875fe3d22fa6");
        cfg.known_addresses = vec![a, a];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_chain_id_rejected() {
        let cfg = ChainConfig::new(0, "https://api.etherscan.io/api");
        assert!(cfg.validate().is_err());
    }
}
