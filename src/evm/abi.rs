/// Minimal ABI surface for the mutation engine: function lookup by 4-byte
/// selector, declared type descriptors, and argument decoding/encoding.
/// Hand-rolled against the Solidity ABI spec; no generated bindings.
use std::collections::HashMap;
use std::fmt;

use primitive_types::{H160, U256};
use serde_json::Value;

use crate::errors::{ReplayError, Result};
use crate::evm::types::{set_hash, EVMAddress};

/// Declared Solidity parameter type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Uint(usize),
    Int(usize),
    Bool,
    String,
    Bytes,
    FixedBytes(usize),
    Array(Box<ParamType>),
    FixedArray(Box<ParamType>, usize),
    Tuple(Vec<ParamType>),
}

impl ParamType {
    /// Parse a canonical type string ("uint256", "address[]", "(bool,bytes)").
    pub fn parse(s: &str) -> Result<ParamType> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(ParamType::Array(Box::new(Self::parse(inner)?)));
        }
        if s.ends_with(']') {
            let open = s
                .rfind('[')
                .ok_or_else(|| ReplayError::parsing(format!("malformed array type {:?}", s)))?;
            let len: usize = s[open + 1..s.len() - 1]
                .parse()
                .map_err(|_| ReplayError::parsing(format!("bad array length in {:?}", s)))?;
            return Ok(ParamType::FixedArray(Box::new(Self::parse(&s[..open])?), len));
        }
        if s.starts_with('(') && s.ends_with(')') {
            return Ok(ParamType::Tuple(split_components(&s[1..s.len() - 1])?));
        }
        match s {
            "address" => Ok(ParamType::Address),
            "bool" => Ok(ParamType::Bool),
            "string" => Ok(ParamType::String),
            "bytes" => Ok(ParamType::Bytes),
            "uint" => Ok(ParamType::Uint(256)),
            "int" => Ok(ParamType::Int(256)),
            _ if s.starts_with("uint") => {
                let bits: usize = s[4..]
                    .parse()
                    .map_err(|_| ReplayError::parsing(format!("bad uint width {:?}", s)))?;
                Ok(ParamType::Uint(bits))
            }
            _ if s.starts_with("int") => {
                let bits: usize = s[3..]
                    .parse()
                    .map_err(|_| ReplayError::parsing(format!("bad int width {:?}", s)))?;
                Ok(ParamType::Int(bits))
            }
            _ if s.starts_with("bytes") => {
                let n: usize = s[5..]
                    .parse()
                    .map_err(|_| ReplayError::parsing(format!("bad bytesN width {:?}", s)))?;
                if n == 0 || n > 32 {
                    return Err(ReplayError::parsing(format!("bytes{} out of range", n)));
                }
                Ok(ParamType::FixedBytes(n))
            }
            _ => Err(ReplayError::parsing(format!("unknown abi type {:?}", s))),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            ParamType::String | ParamType::Bytes | ParamType::Array(_) => true,
            ParamType::FixedArray(inner, _) => inner.is_dynamic(),
            ParamType::Tuple(inner) => inner.iter().any(|t| t.is_dynamic()),
            _ => false,
        }
    }

    /// Bytes this type occupies in the head section.
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            return 32;
        }
        match self {
            ParamType::FixedArray(inner, n) => inner.head_size() * n,
            ParamType::Tuple(inner) => inner.iter().map(|t| t.head_size()).sum(),
            _ => 32,
        }
    }

    pub fn canonical(&self) -> String {
        match self {
            ParamType::Address => "address".to_string(),
            ParamType::Uint(bits) => format!("uint{}", bits),
            ParamType::Int(bits) => format!("int{}", bits),
            ParamType::Bool => "bool".to_string(),
            ParamType::String => "string".to_string(),
            ParamType::Bytes => "bytes".to_string(),
            ParamType::FixedBytes(n) => format!("bytes{}", n),
            ParamType::Array(inner) => format!("{}[]", inner.canonical()),
            ParamType::FixedArray(inner, n) => format!("{}[{}]", inner.canonical(), n),
            ParamType::Tuple(inner) => format!(
                "({})",
                inner
                    .iter()
                    .map(|t| t.canonical())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Split "uint256,(bool,address),bytes[]" into component type strings,
/// respecting parenthesis depth.
fn split_components(s: &str) -> Result<Vec<ParamType>> {
    if s.trim().is_empty() {
        return Ok(vec![]);
    }
    let mut parts = vec![];
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ReplayError::parsing("unbalanced parens in type"))?
            }
            ',' if depth == 0 => {
                parts.push(ParamType::parse(&s[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(ParamType::parse(&s[start..])?);
    Ok(parts)
}

/// A decoded argument value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Address(EVMAddress),
    Uint(U256),
    /// raw two's-complement word
    Int(U256),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    FixedBytes(Vec<u8>),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    pub fn type_of(&self) -> &'static str {
        match self {
            Token::Address(_) => "address",
            Token::Uint(_) => "uint",
            Token::Int(_) => "int",
            Token::Bool(_) => "bool",
            Token::String(_) => "string",
            Token::Bytes(_) => "bytes",
            Token::FixedBytes(_) => "fixed_bytes",
            Token::Array(_) => "array",
            Token::Tuple(_) => "tuple",
        }
    }
}

fn word(data: &[u8], offset: usize) -> Result<[u8; 32]> {
    if offset + 32 > data.len() {
        return Err(ReplayError::decoding(format!(
            "abi data too short: need word at {}, have {} bytes",
            offset,
            data.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&data[offset..offset + 32]);
    Ok(out)
}

fn word_usize(data: &[u8], offset: usize) -> Result<usize> {
    let w = word(data, offset)?;
    let v = U256::from_big_endian(&w);
    if v > U256::from(usize::MAX / 2) {
        return Err(ReplayError::decoding("abi offset/length overflows"));
    }
    Ok(v.as_usize())
}

/// Decode one value of static type located at `offset` within `data`.
fn decode_static(ty: &ParamType, data: &[u8], offset: usize) -> Result<Token> {
    match ty {
        ParamType::Address => {
            let w = word(data, offset)?;
            Ok(Token::Address(H160::from_slice(&w[12..])))
        }
        ParamType::Uint(_) => Ok(Token::Uint(U256::from_big_endian(&word(data, offset)?))),
        ParamType::Int(_) => Ok(Token::Int(U256::from_big_endian(&word(data, offset)?))),
        ParamType::Bool => {
            let w = word(data, offset)?;
            Ok(Token::Bool(w[31] != 0))
        }
        ParamType::FixedBytes(n) => {
            let w = word(data, offset)?;
            Ok(Token::FixedBytes(w[..*n].to_vec()))
        }
        ParamType::FixedArray(inner, n) => {
            let mut items = vec![];
            let mut cursor = offset;
            for _ in 0..*n {
                items.push(decode_static(inner, data, cursor)?);
                cursor += inner.head_size();
            }
            Ok(Token::Array(items))
        }
        ParamType::Tuple(inner) => {
            let mut items = vec![];
            let mut cursor = offset;
            for t in inner {
                items.push(decode_static(t, data, cursor)?);
                cursor += t.head_size();
            }
            Ok(Token::Tuple(items))
        }
        _ => Err(ReplayError::decoding(format!(
            "type {} is not static",
            ty.canonical()
        ))),
    }
}

/// Decode a dynamic value whose tail starts at `data[offset..]`.
fn decode_dynamic(ty: &ParamType, data: &[u8], offset: usize) -> Result<Token> {
    match ty {
        ParamType::String => {
            let len = word_usize(data, offset)?;
            if offset + 32 + len > data.len() {
                return Err(ReplayError::decoding("string payload out of bounds"));
            }
            let raw = &data[offset + 32..offset + 32 + len];
            Ok(Token::String(String::from_utf8_lossy(raw).into_owned()))
        }
        ParamType::Bytes => {
            let len = word_usize(data, offset)?;
            if offset + 32 + len > data.len() {
                return Err(ReplayError::decoding("bytes payload out of bounds"));
            }
            Ok(Token::Bytes(data[offset + 32..offset + 32 + len].to_vec()))
        }
        ParamType::Array(inner) => {
            let len = word_usize(data, offset)?;
            // every element occupies at least one head word; a length
            // claiming more is corrupt (or mutated) data
            if len > data.len() / 32 + 1 {
                return Err(ReplayError::decoding(format!(
                    "array length {} exceeds payload",
                    len
                )));
            }
            let types = vec![(**inner).clone(); len];
            let items = decode_params(&types, &data[offset + 32..])?;
            Ok(Token::Array(items))
        }
        ParamType::FixedArray(inner, n) => {
            let types = vec![(**inner).clone(); *n];
            let items = decode_params(&types, &data[offset..])?;
            Ok(Token::Array(items))
        }
        ParamType::Tuple(inner) => {
            let items = decode_params(inner, &data[offset..])?;
            Ok(Token::Tuple(items))
        }
        _ => decode_static(ty, data, offset),
    }
}

/// Decode a parameter block (no selector) against declared types.
pub fn decode_params(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut head_cursor = 0usize;
    for ty in types {
        if ty.is_dynamic() {
            let tail_offset = word_usize(data, head_cursor)?;
            tokens.push(decode_dynamic(ty, data, tail_offset)?);
            head_cursor += 32;
        } else {
            tokens.push(decode_static(ty, data, head_cursor)?);
            head_cursor += ty.head_size();
        }
    }
    Ok(tokens)
}

fn encode_word_u256(v: &U256) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    v.to_big_endian(&mut out);
    out
}

/// Encode one token. Static tokens return their head bytes; dynamic tokens
/// return their tail (the caller places the offset word).
fn encode_one(ty: &ParamType, token: &Token) -> Result<Vec<u8>> {
    match (ty, token) {
        (ParamType::Address, Token::Address(a)) => {
            let mut out = vec![0u8; 32];
            out[12..].copy_from_slice(a.as_bytes());
            Ok(out)
        }
        (ParamType::Uint(_), Token::Uint(v)) | (ParamType::Int(_), Token::Int(v)) => {
            Ok(encode_word_u256(v))
        }
        (ParamType::Bool, Token::Bool(b)) => {
            let mut out = vec![0u8; 32];
            out[31] = *b as u8;
            Ok(out)
        }
        (ParamType::FixedBytes(n), Token::FixedBytes(data)) => {
            let mut out = vec![0u8; 32];
            let take = data.len().min(*n);
            out[..take].copy_from_slice(&data[..take]);
            Ok(out)
        }
        (ParamType::String, Token::String(s)) => Ok(encode_dynamic_bytes(s.as_bytes())),
        (ParamType::Bytes, Token::Bytes(data)) => Ok(encode_dynamic_bytes(data)),
        (ParamType::Array(inner), Token::Array(items)) => {
            let types = vec![(**inner).clone(); items.len()];
            let body = encode_params(&types, items)?;
            let mut out = encode_word_u256(&U256::from(items.len()));
            out.extend(body);
            Ok(out)
        }
        (ParamType::FixedArray(inner, n), Token::Array(items)) => {
            if items.len() != *n {
                return Err(ReplayError::new(
                    crate::errors::ErrorKind::Encoding,
                    format!("fixed array wants {} items, got {}", n, items.len()),
                ));
            }
            let types = vec![(**inner).clone(); *n];
            encode_params(&types, items)
        }
        (ParamType::Tuple(inner), Token::Tuple(items)) => encode_params(inner, items),
        (ty, token) => Err(ReplayError::new(
            crate::errors::ErrorKind::Encoding,
            format!("token {} does not fit type {}", token.type_of(), ty.canonical()),
        )),
    }
}

fn encode_dynamic_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = encode_word_u256(&U256::from(data.len()));
    let padded = (data.len() + 31) / 32 * 32;
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(0u8).take(padded - data.len()));
    out
}

/// Encode a parameter block (no selector) against declared types.
pub fn encode_params(types: &[ParamType], tokens: &[Token]) -> Result<Vec<u8>> {
    if types.len() != tokens.len() {
        return Err(ReplayError::new(
            crate::errors::ErrorKind::Encoding,
            format!("{} types but {} tokens", types.len(), tokens.len()),
        ));
    }
    let head_size: usize = types.iter().map(|t| t.head_size()).sum();
    let mut head: Vec<u8> = vec![];
    let mut tail: Vec<u8> = vec![];
    for (ty, token) in types.iter().zip(tokens) {
        let encoded = encode_one(ty, token)?;
        if ty.is_dynamic() {
            head.extend(encode_word_u256(&U256::from(head_size + tail.len())));
            tail.extend(encoded);
        } else {
            head.extend(encoded);
        }
    }
    head.extend(tail);
    Ok(head)
}

/// One callable function of a contract ABI.
#[derive(Clone, Debug)]
pub struct AbiFunction {
    pub name: String,
    pub inputs: Vec<ParamType>,
    pub selector: [u8; 4],
    pub is_static: bool,
    pub is_payable: bool,
    pub is_constructor: bool,
}

impl AbiFunction {
    pub fn signature(&self) -> String {
        format!(
            "{}({})",
            self.name,
            self.inputs
                .iter()
                .map(|t| t.canonical())
                .collect::<Vec<_>>()
                .join(",")
        )
    }

    /// Decode full calldata (selector included) into argument tokens.
    pub fn decode_input(&self, calldata: &[u8]) -> Result<Vec<Token>> {
        if calldata.len() < 4 {
            return Err(ReplayError::decoding("calldata shorter than a selector"));
        }
        decode_params(&self.inputs, &calldata[4..])
    }

    /// Encode argument tokens back into full calldata.
    pub fn encode_input(&self, tokens: &[Token]) -> Result<Vec<u8>> {
        let mut out = self.selector.to_vec();
        out.extend(encode_params(&self.inputs, tokens)?);
        Ok(out)
    }
}

/// Parsed contract ABI with selector lookup.
#[derive(Clone, Debug, Default)]
pub struct ContractAbi {
    pub functions: Vec<AbiFunction>,
    by_selector: HashMap<[u8; 4], usize>,
}

impl ContractAbi {
    pub fn parse_abi_str(data: &str) -> Result<Self> {
        let json: Vec<Value> = serde_json::from_str(data)
            .map_err(|e| ReplayError::parsing(format!("failed to parse abi json: {}", e)))?;
        let mut functions = vec![];
        for entry in &json {
            if entry["type"] != "function" && entry["type"] != "constructor" {
                continue;
            }
            let is_constructor = entry["type"] == "constructor";
            let name = if is_constructor {
                "constructor".to_string()
            } else {
                entry["name"]
                    .as_str()
                    .ok_or_else(|| ReplayError::parsing("abi entry without a name"))?
                    .to_string()
            };
            let mut inputs = vec![];
            if let Some(raw_inputs) = entry["inputs"].as_array() {
                for input in raw_inputs {
                    inputs.push(Self::process_input(
                        input["type"].as_str().unwrap_or_default(),
                        input,
                    )?);
                }
            }
            let mutability = entry["stateMutability"].as_str().unwrap_or("nonpayable");
            let mut function = AbiFunction {
                name,
                inputs,
                selector: [0; 4],
                is_static: mutability == "view" || mutability == "pure",
                is_payable: mutability == "payable",
                is_constructor,
            };
            set_hash(function.signature().as_str(), &mut function.selector);
            functions.push(function);
        }
        let mut by_selector = HashMap::new();
        for (i, f) in functions.iter().enumerate() {
            if !f.is_constructor {
                by_selector.insert(f.selector, i);
            }
        }
        Ok(Self {
            functions,
            by_selector,
        })
    }

    /// Resolve a tuple's component list; anything else maps straight through
    /// [`ParamType::parse`].
    fn process_input(ty: &str, input: &Value) -> Result<ParamType> {
        if let Some(components) = input.get("components") {
            let empty = vec![];
            let inner: Result<Vec<ParamType>> = components
                .as_array()
                .unwrap_or(&empty)
                .iter()
                .map(|c| Self::process_input(c["type"].as_str().unwrap_or_default(), c))
                .collect();
            let tuple = ParamType::Tuple(inner?);
            if ty == "tuple" {
                return Ok(tuple);
            }
            if ty == "tuple[]" {
                return Ok(ParamType::Array(Box::new(tuple)));
            }
            return Err(ReplayError::parsing(format!("unknown composite type {:?}", ty)));
        }
        ParamType::parse(ty)
    }

    pub fn function_by_selector(&self, selector: [u8; 4]) -> Option<&AbiFunction> {
        self.by_selector.get(&selector).map(|&i| &self.functions[i])
    }

    pub fn function_for_calldata(&self, calldata: &[u8]) -> Option<&AbiFunction> {
        if calldata.len() < 4 {
            return None;
        }
        self.function_by_selector([calldata[0], calldata[1], calldata[2], calldata[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ERC20_ABI: &str = r#"[
        {"type":"function","name":"transfer","stateMutability":"nonpayable",
         "inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}]},
        {"type":"function","name":"balanceOf","stateMutability":"view",
         "inputs":[{"name":"owner","type":"address"}]}
    ]"#;

    #[test]
    fn parse_computes_selectors() {
        let abi = ContractAbi::parse_abi_str(ERC20_ABI).unwrap();
        let transfer = abi
            .function_by_selector([0xa9, 0x05, 0x9c, 0xbb])
            .expect("transfer selector");
        assert_eq!(transfer.name, "transfer");
        assert!(abi.functions.iter().any(|f| f.is_static));
    }

    #[test]
    fn static_roundtrip() {
        let abi = ContractAbi::parse_abi_str(ERC20_ABI).unwrap();
        let transfer = abi.function_by_selector([0xa9, 0x05, 0x9c, 0xbb]).unwrap();
        let tokens = vec![
            Token::Address(H160::from_str("0x1111111111111111111111111111111111111111").unwrap()),
            Token::Uint(U256::from(42u64)),
        ];
        let calldata = transfer.encode_input(&tokens).unwrap();
        assert_eq!(calldata.len(), 4 + 64);
        assert_eq!(transfer.decode_input(&calldata).unwrap(), tokens);
    }

    #[test]
    fn dynamic_roundtrip() {
        let types = vec![ParamType::String, ParamType::Uint(256), ParamType::Bytes];
        let tokens = vec![
            Token::String("hello".to_string()),
            Token::Uint(U256::from(7u64)),
            Token::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
        ];
        let encoded = encode_params(&types, &tokens).unwrap();
        assert_eq!(decode_params(&types, &encoded).unwrap(), tokens);
    }

    #[test]
    fn array_roundtrip() {
        let types = vec![ParamType::Array(Box::new(ParamType::Uint(256)))];
        let tokens = vec![Token::Array(vec![
            Token::Uint(U256::from(1u64)),
            Token::Uint(U256::from(2u64)),
            Token::Uint(U256::from(3u64)),
        ])];
        let encoded = encode_params(&types, &tokens).unwrap();
        assert_eq!(decode_params(&types, &encoded).unwrap(), tokens);
    }

    #[test]
    fn type_parsing() {
        assert_eq!(ParamType::parse("uint256").unwrap(), ParamType::Uint(256));
        assert_eq!(
            ParamType::parse("bytes8[4]").unwrap(),
            ParamType::FixedArray(Box::new(ParamType::FixedBytes(8)), 4)
        );
        assert!(ParamType::parse("flarb").is_err());
        assert!(ParamType::parse("bytes33").is_err());
    }

    #[test]
    fn truncated_calldata_is_decoding_error() {
        let abi = ContractAbi::parse_abi_str(ERC20_ABI).unwrap();
        let transfer = abi.function_by_selector([0xa9, 0x05, 0x9c, 0xbb]).unwrap();
        let err = transfer.decode_input(&[0xa9, 0x05, 0x9c, 0xbb, 0x01]).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Decoding);
    }
}
