/// ABI-type-aware mutation: decode calldata against the declared types and
/// mutate each argument by what it is, not what bytes it happens to hold.
use once_cell::sync::Lazy;
use primitive_types::{H160, U256};
use rand::random;

use crate::config::{AddressMutationConfig, NumberMutationConfig, StringMutationConfig};
use crate::evm::abi::{AbiFunction, ParamType, Token};
use crate::evm::types::{convert_h160_to_u256, convert_u256_to_h160, fixed_address, EVMAddress};
use crate::mutation::{ModificationType, MutationCandidate};
use crate::evm::types::StorageMap;

/// Liquidity-bearing addresses worth substituting on mainnet.
static ETH_KNOWN_ADDRESSES: Lazy<Vec<EVMAddress>> = Lazy::new(|| {
    [
        "c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", // WETH
        "a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", // USDC
        "dac17f958d2ee523a2206206994597c13d831ec7", // USDT
        "7a250d5630b4cf539739df2c5dacb4c659f2488d", // UniswapV2 router
        "e592427a0aece92de3edee1f18e0157c05861564", // UniswapV3 router
    ]
    .iter()
    .map(|s| fixed_address(s))
    .collect()
});

static BSC_KNOWN_ADDRESSES: Lazy<Vec<EVMAddress>> = Lazy::new(|| {
    [
        "bb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c", // WBNB
        "e9e7cea3dedca5984780bafc599bd69add087d56", // BUSD
        "10ed43c718714eb63d5aa57b78b54704e256024e", // Pancake router
        "55d398326f99059ff775485246999027b3197955", // BSC-USD
    ]
    .iter()
    .map(|s| fixed_address(s))
    .collect()
});

static DEFAULT_KNOWN_ADDRESSES: Lazy<Vec<EVMAddress>> = Lazy::new(|| {
    vec![
        EVMAddress::zero(),
        fixed_address("000000000000000000000000000000000000dead"),
        fixed_address("0000000000000000000000000000000000000001"),
    ]
});

pub fn known_addresses_for_chain(chain_id: u64) -> &'static [EVMAddress] {
    match chain_id {
        1 => &ETH_KNOWN_ADDRESSES,
        56 => &BSC_KNOWN_ADDRESSES,
        _ => &DEFAULT_KNOWN_ADDRESSES,
    }
}

const APPEND_BYTES: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

pub struct TypeAwareMutator {
    pub chain_id: u64,
    pub address_config: AddressMutationConfig,
    pub number_config: NumberMutationConfig,
    pub string_config: StringMutationConfig,
    /// operator-supplied addresses, tried before the built-in pool
    pub extra_known_addresses: Vec<EVMAddress>,
}

impl TypeAwareMutator {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            address_config: AddressMutationConfig::default(),
            number_config: NumberMutationConfig::default(),
            string_config: StringMutationConfig::default(),
            extra_known_addresses: vec![],
        }
    }

    pub fn with_chain_config(mut self, config: &crate::config::ChainConfig) -> Self {
        self.extra_known_addresses = config.known_addresses.clone();
        self.address_config.use_known |= !config.known_addresses.is_empty();
        self
    }

    fn known_pool_entry(&self, idx: usize) -> EVMAddress {
        let builtin = known_addresses_for_chain(self.chain_id);
        let total = self.extra_known_addresses.len() + builtin.len();
        let idx = idx % total.max(1);
        if idx < self.extra_known_addresses.len() {
            self.extra_known_addresses[idx]
        } else {
            builtin[idx - self.extra_known_addresses.len()]
        }
    }

    /// Mask a mutated word back into its declared width so `uint8`
    /// arguments stay decodable as `uint8`.
    fn mask_to_width(value: U256, bits: usize) -> U256 {
        if bits >= 256 {
            value
        } else {
            value % (U256::one() << bits)
        }
    }

    /// Mutate one decoded argument. `variant` selects the strategy via
    /// `variant mod k` where `k` is the per-type strategy count. Returns
    /// `None` when the strategy is a no-op on this value.
    pub fn mutate_token(&self, token: &Token, ty: &ParamType, variant: u64) -> Option<Token> {
        match (token, ty) {
            (Token::Address(addr), ParamType::Address) => {
                self.mutate_address(*addr, variant).map(Token::Address)
            }
            (Token::Uint(v), ParamType::Uint(bits)) => self
                .mutate_uint(*v, variant)
                .map(|m| Self::mask_to_width(m, *bits))
                .filter(|m| m != v)
                .map(Token::Uint),
            (Token::Int(v), ParamType::Int(bits)) => self
                .mutate_int(*v, variant)
                .map(|m| Self::mask_to_width(m, *bits))
                .filter(|m| m != v)
                .map(Token::Int),
            (Token::Bool(b), ParamType::Bool) => Some(Token::Bool(!b)),
            (Token::String(s), ParamType::String) => {
                self.mutate_string(s, variant).map(Token::String)
            }
            (Token::Bytes(data), ParamType::Bytes) => {
                self.mutate_bytes(data, variant).map(Token::Bytes)
            }
            (Token::FixedBytes(data), ParamType::FixedBytes(size)) => {
                self.mutate_fixed_bytes(data, *size, variant).map(Token::FixedBytes)
            }
            // arrays and slices pass through unchanged; mutation of element
            // lists is an open extension point
            (Token::Array(_), _) | (Token::Tuple(_), _) => None,
            _ => None,
        }
    }

    fn mutate_address(&self, addr: EVMAddress, variant: u64) -> Option<EVMAddress> {
        match variant % 5 {
            0 => {
                // step the low bytes, wrapping per byte
                let steps = &self.address_config.flip_bytes;
                let flips = steps[(variant as usize / 5) % steps.len()].min(3).max(1);
                let step = (variant / 5 % 256) as u8;
                let mut bytes = addr.0;
                for i in 0..flips {
                    let idx = 19 - i;
                    bytes[idx] = bytes[idx].wrapping_add(step);
                }
                let mutated = H160::from(bytes);
                if mutated == addr {
                    None
                } else {
                    Some(mutated)
                }
            }
            1 => {
                if !self.address_config.use_known {
                    return None;
                }
                let candidate = self.known_pool_entry(variant as usize / 5);
                if candidate == addr {
                    None
                } else {
                    Some(candidate)
                }
            }
            2 => {
                // nearby address, wrapping modulo 2^160
                if self.address_config.nearby_range == 0 {
                    return None;
                }
                let delta = U256::from(variant % self.address_config.nearby_range + 1);
                let base = convert_h160_to_u256(addr);
                let modulus = U256::one() << 160;
                let shifted = if variant % 2 == 0 {
                    (base + delta) % modulus
                } else {
                    (base + modulus - (delta % modulus)) % modulus
                };
                Some(convert_u256_to_h160(shifted))
            }
            3 => {
                if addr.is_zero() || self.address_config.zero_ratio <= 0.0 {
                    None
                } else {
                    Some(EVMAddress::zero())
                }
            }
            _ => Some(H160::from(random::<[u8; 20]>())),
        }
    }

    fn mutate_uint(&self, value: U256, variant: u64) -> Option<U256> {
        let mutated = match variant % 5 {
            0 => {
                let steps = &self.number_config.step_sizes;
                let step = steps[(variant as usize / 5) % steps.len()];
                crate::mutation::step::apply_step(value, step)
            }
            1 => {
                let multipliers = &self.number_config.multiplier_ratio;
                let m = multipliers[(variant as usize / 5) % multipliers.len()];
                value.overflowing_mul(U256::from(m)).0
            }
            2 => {
                let bounds = &self.number_config.boundary_values;
                U256::from(bounds[(variant as usize / 5) % bounds.len()])
            }
            3 => {
                let patterns = &self.number_config.bit_patterns;
                U256::from(patterns[(variant as usize / 5) % patterns.len()])
            }
            _ => U256::one() << (variant / 5 % 256),
        };
        if mutated == value {
            None
        } else {
            Some(mutated)
        }
    }

    fn mutate_int(&self, value: U256, variant: u64) -> Option<U256> {
        let mutated = match variant % 3 {
            0 => {
                let steps = &self.number_config.step_sizes;
                let step = steps[(variant as usize / 3) % steps.len()];
                // signed step: two's complement wrap instead of clamping
                if step >= 0 {
                    value.overflowing_add(U256::from(step as u64)).0
                } else {
                    value.overflowing_sub(U256::from(step.unsigned_abs())).0
                }
            }
            1 => U256::zero().overflowing_sub(value).0, // negate
            _ => {
                let boundaries = [
                    U256::zero(),
                    U256::one(),
                    U256::MAX,                          // -1
                    U256::from(i64::MAX as u64),
                    U256::zero().overflowing_sub(U256::from(i64::MAX as u64)).0,
                ];
                boundaries[(variant as usize / 3) % boundaries.len()]
            }
        };
        if mutated == value {
            None
        } else {
            Some(mutated)
        }
    }

    fn mutate_string(&self, s: &str, variant: u64) -> Option<String> {
        let mutated = match variant % 7 {
            0 => format!("{}x", s),
            1 => format!("x{}", s),
            2 => {
                if s.is_empty() {
                    return None;
                }
                s[..s.len() / 2].to_string()
            }
            3 => "replaced".to_string(),
            4 => {
                if s.is_empty() {
                    return None;
                }
                String::new()
            }
            5 => {
                let mut repeated = s.repeat(2 + (variant as usize / 7) % 4);
                repeated.truncate(self.string_config.max_length);
                repeated
            }
            _ => {
                let chars = &self.string_config.special_chars;
                let c = chars[(variant as usize / 7) % chars.len()];
                format!("{}{}", s, c)
            }
        };
        if mutated == s {
            None
        } else {
            Some(mutated)
        }
    }

    /// Encoding probes for string arguments: percent- and hex-escaped
    /// renderings that survive naive sanitisers.
    pub fn encoding_variants(&self, s: &str, variant: u64) -> Option<String> {
        if !self.string_config.encoding_tests || s.is_empty() {
            return None;
        }
        let mutated = match variant % 3 {
            0 => s.bytes().map(|b| format!("%{:02x}", b)).collect::<String>(),
            1 => format!("0x{}", hex::encode(s.as_bytes())),
            _ => s
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_string()
                    } else {
                        format!("\\u{{{:x}}}", c as u32)
                    }
                })
                .collect::<String>(),
        };
        if mutated == s {
            None
        } else {
            Some(mutated)
        }
    }

    fn mutate_bytes(&self, data: &[u8], variant: u64) -> Option<Vec<u8>> {
        let mutated = match variant % 5 {
            0 => {
                if data.is_empty() {
                    return None;
                }
                // xor-flip 1..3 trailing bytes; applying twice restores
                let mut out = data.to_vec();
                let flips = (1 + (variant as usize / 5) % 3).min(out.len());
                let len = out.len();
                for i in 0..flips {
                    out[len - 1 - i] ^= 0xff;
                }
                out
            }
            1 => [data, &APPEND_BYTES[..]].concat(),
            2 => {
                if data.is_empty() {
                    return None;
                }
                data[..data.len() / 2].to_vec()
            }
            3 => APPEND_BYTES.to_vec(),
            _ => {
                if data.is_empty() {
                    return None;
                }
                vec![]
            }
        };
        if mutated == data {
            None
        } else {
            Some(mutated)
        }
    }

    fn mutate_fixed_bytes(&self, data: &[u8], size: usize, variant: u64) -> Option<Vec<u8>> {
        if size == 0 || data.is_empty() {
            return None;
        }
        let mut out = data.to_vec();
        let idx = (variant as usize) % size.min(out.len());
        let xor = (variant % 255 + 1) as u8;
        out[idx] ^= xor;
        Some(out)
    }

    /// Decode `calldata` per `function`, mutate the argument selected by
    /// `variant`, and re-encode. Returns `None` when decoding fails, the
    /// selected strategy is a no-op, or the calldata carries no arguments.
    pub fn mutate_calldata(
        &self,
        function: &AbiFunction,
        calldata: &[u8],
        variant: u64,
    ) -> Option<Vec<u8>> {
        if function.inputs.is_empty() {
            return None;
        }
        let mut tokens = function.decode_input(calldata).ok()?;
        let param_idx = (variant as usize) % function.inputs.len();
        let ty = &function.inputs[param_idx];
        let mutated = self.mutate_token(&tokens[param_idx], ty, variant / function.inputs.len() as u64)?;
        tokens[param_idx] = mutated;
        let encoded = function.encode_input(&tokens).ok()?;
        if encoded == calldata {
            None
        } else {
            Some(encoded)
        }
    }

    /// Generate type-aware input candidates for a decoded call.
    pub fn generate(
        &self,
        function: &AbiFunction,
        calldata: &[u8],
        count: usize,
        id_start: u64,
    ) -> Vec<MutationCandidate> {
        let mut out = vec![];
        for v in 0..count as u64 {
            if let Some(input) = self.mutate_calldata(function, calldata, v) {
                let param_idx = (v as usize) % function.inputs.len().max(1);
                let ty = function.inputs[param_idx].canonical();
                out.push(
                    MutationCandidate::new(
                        id_start + v,
                        Some(input),
                        StorageMap::new(),
                        ModificationType::InputStep,
                        format!("type_aware_{}", ty),
                    )
                    .with_impact(format!("typed mutation of {} arg {}", ty, param_idx)),
                );
            }
        }
        out
    }
}
