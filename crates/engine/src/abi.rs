//! Event ABI parsing and log decoding
//!
//! Supports the value types event handlers need in practice:
//!
//! | type | head word | indexed |
//! |---|---|---|
//! | `address`, `bool`, `uintN`, `intN`, `bytesN` | value | value |
//! | `bytes`, `string` | offset to length + payload | keccak256 of the value |
//!
//! Arrays and tuples are rejected when the signature is parsed.

use crate::provider::{Log, RawEvent};
use alloy_primitives::{hex, keccak256, Address, Bytes, B256, I256, U256};
use chainstore_core::error::{Error, Result};
use serde_json::Value;
use std::fmt;

const WORD: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// Solidity type of one event parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `address`
    Address,
    /// `bool`
    Bool,
    /// `uintN`
    Uint(usize),
    /// `intN`
    Int(usize),
    /// `bytesN`
    FixedBytes(usize),
    /// `bytes`
    Bytes,
    /// `string`
    String,
}

impl ParamType {
    fn parse(raw: &str) -> Result<Self> {
        let unsupported = || Error::Decode(format!("unsupported ABI type {:?}", raw));
        let sized = |digits: &str, max: usize, step: usize| -> Result<usize> {
            let n: usize = digits.parse().map_err(|_| unsupported())?;
            if n == 0 || n > max || n % step != 0 {
                return Err(unsupported());
            }
            Ok(n)
        };

        match raw {
            "address" => Ok(ParamType::Address),
            "bool" => Ok(ParamType::Bool),
            "bytes" => Ok(ParamType::Bytes),
            "string" => Ok(ParamType::String),
            "uint" => Ok(ParamType::Uint(256)),
            "int" => Ok(ParamType::Int(256)),
            _ => {
                if let Some(bits) = raw.strip_prefix("uint") {
                    Ok(ParamType::Uint(sized(bits, 256, 8)?))
                } else if let Some(bits) = raw.strip_prefix("int") {
                    Ok(ParamType::Int(sized(bits, 256, 8)?))
                } else if let Some(len) = raw.strip_prefix("bytes") {
                    Ok(ParamType::FixedBytes(sized(len, 32, 1)?))
                } else {
                    Err(unsupported())
                }
            }
        }
    }

    /// Whether the value lives behind an offset in the data section.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ParamType::Bytes | ParamType::String)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Address => write!(f, "address"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::Uint(bits) => write!(f, "uint{}", bits),
            ParamType::Int(bits) => write!(f, "int{}", bits),
            ParamType::FixedBytes(len) => write!(f, "bytes{}", len),
            ParamType::Bytes => write!(f, "bytes"),
            ParamType::String => write!(f, "string"),
        }
    }
}

/// One event parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParam {
    /// Parameter name, empty if unnamed
    pub name: String,
    /// Solidity type
    pub kind: ParamType,
    /// Whether the value is carried in a topic
    pub indexed: bool,
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    /// `address`
    Address(Address),
    /// `bool`
    Bool(bool),
    /// `uintN`
    Uint(U256),
    /// `intN`
    Int(I256),
    /// `bytesN`
    FixedBytes(Vec<u8>),
    /// `bytes`
    Bytes(Bytes),
    /// `string`
    String(String),
    /// Hash of an indexed dynamic value
    Topic(B256),
}

impl AbiValue {
    /// JSON rendering used in structured errors; integers become decimal
    /// strings.
    pub fn to_json(&self) -> Value {
        match self {
            AbiValue::Address(a) => Value::String(hex::encode_prefixed(a)),
            AbiValue::Bool(b) => Value::Bool(*b),
            AbiValue::Uint(v) => Value::String(v.to_string()),
            AbiValue::Int(v) => Value::String(v.to_string()),
            AbiValue::FixedBytes(b) => Value::String(hex::encode_prefixed(b)),
            AbiValue::Bytes(b) => Value::String(hex::encode_prefixed(b)),
            AbiValue::String(s) => Value::String(s.clone()),
            AbiValue::Topic(t) => Value::String(hex::encode_prefixed(t)),
        }
    }
}

/// Positional arguments of one decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventArgs {
    values: Vec<AbiValue>,
}

impl EventArgs {
    /// Wrap positional values.
    pub fn new(values: Vec<AbiValue>) -> Self {
        Self { values }
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the event has no arguments
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument at `index`.
    pub fn get(&self, index: usize) -> Result<&AbiValue> {
        self.values
            .get(index)
            .ok_or_else(|| Error::Decode(format!("event has no argument {}", index)))
    }

    /// `address` argument at `index`.
    pub fn address(&self, index: usize) -> Result<Address> {
        match self.get(index)? {
            AbiValue::Address(a) => Ok(*a),
            other => Err(mismatch(index, "address", other)),
        }
    }

    /// `uintN` argument at `index`.
    pub fn uint(&self, index: usize) -> Result<U256> {
        match self.get(index)? {
            AbiValue::Uint(v) => Ok(*v),
            other => Err(mismatch(index, "uint", other)),
        }
    }

    /// `intN` argument at `index`.
    pub fn int(&self, index: usize) -> Result<I256> {
        match self.get(index)? {
            AbiValue::Int(v) => Ok(*v),
            other => Err(mismatch(index, "int", other)),
        }
    }

    /// `bool` argument at `index`.
    pub fn bool(&self, index: usize) -> Result<bool> {
        match self.get(index)? {
            AbiValue::Bool(v) => Ok(*v),
            other => Err(mismatch(index, "bool", other)),
        }
    }

    /// `string` argument at `index`.
    pub fn string(&self, index: usize) -> Result<&str> {
        match self.get(index)? {
            AbiValue::String(v) => Ok(v),
            other => Err(mismatch(index, "string", other)),
        }
    }

    /// All arguments as a JSON array.
    pub fn to_json(&self) -> Value {
        Value::Array(self.values.iter().map(AbiValue::to_json).collect())
    }
}

fn mismatch(index: usize, wanted: &str, got: &AbiValue) -> Error {
    Error::Decode(format!("argument {} is not {}: {:?}", index, wanted, got))
}

// ============================================================================
// EventAbi
// ============================================================================

/// A parsed event signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAbi {
    /// Event name
    pub name: String,
    /// Parameters in declaration order
    pub inputs: Vec<EventParam>,
}

impl EventAbi {
    /// Parse a human readable signature such as
    /// `event Transfer(address indexed from, address indexed to, uint256 value)`.
    ///
    /// The `event` keyword and parameter names are optional.
    pub fn parse(signature: &str) -> Result<Self> {
        let signature = signature.trim();
        let signature = signature.strip_prefix("event ").unwrap_or(signature).trim();
        let malformed = || Error::Decode(format!("malformed event signature {:?}", signature));

        let open = signature.find('(').ok_or_else(malformed)?;
        let body = signature[open + 1..].strip_suffix(')').ok_or_else(malformed)?;
        let name = signature[..open].trim();
        if name.is_empty() || body.contains(['(', ')', '[', ']']) {
            return Err(malformed());
        }

        let mut inputs = Vec::new();
        for param in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut words = param.split_whitespace();
            let kind = ParamType::parse(words.next().ok_or_else(malformed)?)?;
            let mut indexed = false;
            let mut name = String::new();
            for word in words {
                match word {
                    "indexed" if !indexed && name.is_empty() => indexed = true,
                    _ if name.is_empty() => name = word.to_string(),
                    _ => return Err(malformed()),
                }
            }
            inputs.push(EventParam {
                name,
                kind,
                indexed,
            });
        }

        Ok(Self {
            name: name.to_string(),
            inputs,
        })
    }

    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn canonical_signature(&self) -> String {
        let types: Vec<String> = self.inputs.iter().map(|p| p.kind.to_string()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// Topic 0 of logs emitting this event.
    pub fn selector(&self) -> B256 {
        keccak256(self.canonical_signature().as_bytes())
    }

    /// Decode a log's topics and data into positional arguments.
    pub fn decode(&self, log: &Log) -> Result<EventArgs> {
        let indexed_count = self.inputs.iter().filter(|p| p.indexed).count();
        if log.topics.first() != Some(&self.selector()) {
            return Err(Error::Decode(format!(
                "log topic does not match {}",
                self.canonical_signature()
            )));
        }
        if log.topics.len() != indexed_count + 1 {
            return Err(Error::Decode(format!(
                "{} expects {} topics, log has {}",
                self.canonical_signature(),
                indexed_count + 1,
                log.topics.len()
            )));
        }

        let mut topics = log.topics[1..].iter();
        let mut head = 0;
        let mut values = Vec::with_capacity(self.inputs.len());
        for param in &self.inputs {
            let value = if param.indexed {
                let topic = topics.next().ok_or_else(|| {
                    Error::Decode(format!("missing topic for {}", param.name))
                })?;
                if param.kind.is_dynamic() {
                    AbiValue::Topic(*topic)
                } else {
                    decode_word(param.kind, topic.as_slice())?
                }
            } else {
                let word = read_word(&log.data, head)?;
                let value = if param.kind.is_dynamic() {
                    decode_dynamic(param.kind, &log.data, word)?
                } else {
                    decode_word(param.kind, word)?
                };
                head += WORD;
                value
            };
            values.push(value);
        }
        Ok(EventArgs::new(values))
    }

    /// Encode `values` as an event emitted by `address`.
    ///
    /// Inverse of [`Self::decode`] for non-indexed values; indexed dynamic
    /// values are hashed into their topic.
    pub fn encode(&self, address: Address, values: &[AbiValue]) -> Result<RawEvent> {
        if values.len() != self.inputs.len() {
            return Err(Error::Decode(format!(
                "{} takes {} arguments, got {}",
                self.canonical_signature(),
                self.inputs.len(),
                values.len()
            )));
        }

        let mut topics = vec![self.selector()];
        let mut heads: Vec<[u8; WORD]> = Vec::new();
        let mut tails: Vec<(usize, Vec<u8>)> = Vec::new();
        for (param, value) in self.inputs.iter().zip(values) {
            match (param.indexed, value) {
                (true, AbiValue::Bytes(b)) => topics.push(keccak256(b)),
                (true, AbiValue::String(s)) => topics.push(keccak256(s.as_bytes())),
                (true, v) => topics.push(B256::from(encode_word(v)?)),
                (false, AbiValue::Bytes(b)) => {
                    tails.push((heads.len(), b.to_vec()));
                    heads.push([0; WORD]);
                }
                (false, AbiValue::String(s)) => {
                    tails.push((heads.len(), s.as_bytes().to_vec()));
                    heads.push([0; WORD]);
                }
                (false, v) => heads.push(encode_word(v)?),
            }
        }

        let mut tail_bytes = Vec::new();
        for (slot, payload) in tails {
            let offset = heads.len() * WORD + tail_bytes.len();
            heads[slot] = U256::from(offset).to_be_bytes();
            tail_bytes.extend_from_slice(&U256::from(payload.len()).to_be_bytes::<WORD>());
            tail_bytes.extend_from_slice(&payload);
            tail_bytes.resize(tail_bytes.len().div_ceil(WORD) * WORD, 0);
        }

        let mut data: Vec<u8> = heads.concat();
        data.extend_from_slice(&tail_bytes);
        Ok(RawEvent {
            address,
            topics,
            data: Bytes::from(data),
        })
    }
}

impl fmt::Display for EventAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .inputs
            .iter()
            .map(|p| {
                let mut out = p.kind.to_string();
                if p.indexed {
                    out.push_str(" indexed");
                }
                if !p.name.is_empty() {
                    out.push(' ');
                    out.push_str(&p.name);
                }
                out
            })
            .collect();
        write!(f, "event {}({})", self.name, params.join(", "))
    }
}

// ============================================================================
// Word codec
// ============================================================================

fn read_word(data: &[u8], at: usize) -> Result<&[u8]> {
    data.get(at..at + WORD)
        .ok_or_else(|| Error::Decode(format!("data too short for word at {}", at)))
}

fn word_to_usize(word: &[u8]) -> Result<usize> {
    let value = U256::from_be_slice(word);
    usize::try_from(value).map_err(|_| Error::Decode(format!("offset {} out of range", value)))
}

fn decode_word(kind: ParamType, word: &[u8]) -> Result<AbiValue> {
    match kind {
        ParamType::Address => {
            if word[..12].iter().any(|b| *b != 0) {
                return Err(Error::Decode("address word has dirty high bytes".to_string()));
            }
            Ok(AbiValue::Address(Address::from_slice(&word[12..])))
        }
        ParamType::Bool => match U256::from_be_slice(word) {
            v if v == U256::ZERO => Ok(AbiValue::Bool(false)),
            v if v == U256::from(1) => Ok(AbiValue::Bool(true)),
            v => Err(Error::Decode(format!("invalid bool word {}", v))),
        },
        ParamType::Uint(bits) => {
            let value = U256::from_be_slice(word);
            if value.bit_len() > bits {
                return Err(Error::Decode(format!("value {} overflows uint{}", value, bits)));
            }
            Ok(AbiValue::Uint(value))
        }
        ParamType::Int(_) => Ok(AbiValue::Int(I256::from_raw(U256::from_be_slice(word)))),
        ParamType::FixedBytes(len) => Ok(AbiValue::FixedBytes(word[..len].to_vec())),
        ParamType::Bytes | ParamType::String => Err(Error::Decode(format!(
            "{} is not a single word type",
            kind
        ))),
    }
}

fn decode_dynamic(kind: ParamType, data: &[u8], offset_word: &[u8]) -> Result<AbiValue> {
    let offset = word_to_usize(offset_word)?;
    let len = word_to_usize(read_word(data, offset)?)?;
    let start = offset + WORD;
    let payload = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| Error::Decode(format!("{} payload out of bounds", kind)))?;
    match kind {
        ParamType::Bytes => Ok(AbiValue::Bytes(Bytes::copy_from_slice(payload))),
        _ => String::from_utf8(payload.to_vec())
            .map(AbiValue::String)
            .map_err(|_| Error::Decode("string argument is not UTF-8".to_string())),
    }
}

fn encode_word(value: &AbiValue) -> Result<[u8; WORD]> {
    let mut word = [0u8; WORD];
    match value {
        AbiValue::Address(a) => word[12..].copy_from_slice(a.as_slice()),
        AbiValue::Bool(b) => word[WORD - 1] = u8::from(*b),
        AbiValue::Uint(v) => word = v.to_be_bytes(),
        AbiValue::Int(v) => word = v.into_raw().to_be_bytes(),
        AbiValue::FixedBytes(b) if b.len() <= WORD => word[..b.len()].copy_from_slice(b),
        AbiValue::Topic(t) => word.copy_from_slice(t.as_slice()),
        other => {
            return Err(Error::Decode(format!("{:?} is not a single word value", other)));
        }
    }
    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";

    fn log_from(event: RawEvent) -> Log {
        Log {
            address: event.address,
            topics: event.topics,
            data: event.data,
            block_number: 1,
            block_hash: "0x1".to_string(),
            transaction_index: 0,
            log_index: 0,
            transaction_hash: None,
        }
    }

    #[test]
    fn test_parse_and_selector() {
        let abi = EventAbi::parse(TRANSFER).unwrap();
        assert_eq!(abi.canonical_signature(), "Transfer(address,address,uint256)");
        assert_eq!(
            hex::encode(abi.selector()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(abi.to_string(), TRANSFER);

        let bare = EventAbi::parse("Approval(address,address,uint)").unwrap();
        assert_eq!(bare.canonical_signature(), "Approval(address,address,uint256)");
    }

    #[test]
    fn test_parse_rejects_unsupported() {
        assert!(EventAbi::parse("event A(uint256[] xs)").is_err());
        assert!(EventAbi::parse("event A((uint256,bool) t)").is_err());
        assert!(EventAbi::parse("event A(uint7 x)").is_err());
        assert!(EventAbi::parse("event A(bytes33 x)").is_err());
        assert!(EventAbi::parse("A").is_err());
    }

    #[test]
    fn test_decode_transfer() {
        let abi = EventAbi::parse(TRANSFER).unwrap();
        let from = Address::repeat_byte(0x11);
        let to = Address::repeat_byte(0x22);
        let event = abi
            .encode(
                Address::repeat_byte(0xee),
                &[AbiValue::Address(from), AbiValue::Address(to), AbiValue::Uint(U256::from(5))],
            )
            .unwrap();
        assert_eq!(event.topics.len(), 3);
        assert_eq!(event.data.len(), 32);

        let args = abi.decode(&log_from(event)).unwrap();
        assert_eq!(args.address(0).unwrap(), from);
        assert_eq!(args.address(1).unwrap(), to);
        assert_eq!(args.uint(2).unwrap(), U256::from(5));
        assert!(args.bool(2).is_err());
        assert_eq!(args.to_json()[2], "5");
    }

    #[test]
    fn test_decode_dynamic_and_signed() {
        let abi = EventAbi::parse(
            "event Voted(address indexed voter, string indexed topic, int128 weight, string reason, bytes extra, bool support)",
        )
        .unwrap();
        let values = vec![
            AbiValue::Address(Address::repeat_byte(1)),
            AbiValue::String("budget".to_string()),
            AbiValue::Int(I256::try_from(-42i64).unwrap()),
            AbiValue::String("a reason longer than one word of thirty-two bytes".to_string()),
            AbiValue::Bytes(Bytes::from(vec![0xde, 0xad])),
            AbiValue::Bool(true),
        ];
        let args = abi
            .decode(&log_from(abi.encode(Address::ZERO, &values).unwrap()))
            .unwrap();

        assert_eq!(args.get(1).unwrap(), &AbiValue::Topic(keccak256("budget".as_bytes())));
        assert_eq!(args.int(2).unwrap(), I256::try_from(-42i64).unwrap());
        assert_eq!(args.string(3).unwrap(), "a reason longer than one word of thirty-two bytes");
        assert_eq!(args.get(4).unwrap(), &values[4]);
        assert!(args.bool(5).unwrap());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let abi = EventAbi::parse(TRANSFER).unwrap();
        let mut log = log_from(
            abi.encode(
                Address::ZERO,
                &[
                    AbiValue::Address(Address::ZERO),
                    AbiValue::Address(Address::ZERO),
                    AbiValue::Uint(U256::from(1)),
                ],
            )
            .unwrap(),
        );

        let mut short = log.clone();
        short.data = Bytes::new();
        assert!(matches!(abi.decode(&short), Err(Error::Decode(_))));

        log.topics.pop();
        assert!(matches!(abi.decode(&log), Err(Error::Decode(_))));
    }
}
