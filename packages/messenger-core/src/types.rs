use serde::{Deserialize, Deserializer, Serialize, Serializer};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;

use crate::Error;

pub type Sequence = u64;
pub type Nonce = u32;

/// 支持的链，取值与跨链协议的 u16 链标识一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[repr(u16)]
pub enum ChainId {
    Solana = 1,
    Ethereum = 2,
    Bsc = 4,
}

impl ChainId {
    pub const ALL: [ChainId; 3] = [ChainId::Solana, ChainId::Ethereum, ChainId::Bsc];

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            ChainId::Solana => "Solana",
            ChainId::Ethereum => "Ethereum",
            ChainId::Bsc => "BSC",
        }
    }

    pub fn family(self) -> ChainFamily {
        match self {
            ChainId::Solana => ChainFamily::Solana,
            ChainId::Ethereum | ChainId::Bsc => ChainFamily::Evm,
        }
    }
}

impl TryFrom<u16> for ChainId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ChainId::ALL
            .into_iter()
            .find(|c| c.to_u16() == value)
            .ok_or_else(|| Error::Config(format!("Unsupported chain id: {}", value)))
    }
}

impl From<ChainId> for u16 {
    fn from(chain: ChainId) -> Self {
        chain.to_u16()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChainId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<u16>() {
            return ChainId::try_from(id);
        }
        match s.to_ascii_lowercase().as_str() {
            "solana" | "sol" => Ok(ChainId::Solana),
            "ethereum" | "eth" => Ok(ChainId::Ethereum),
            "bsc" => Ok(ChainId::Bsc),
            _ => Err(Error::Config(format!("Unknown chain: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Solana,
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainFamily::Evm => f.write_str("evm"),
            ChainFamily::Solana => f.write_str("solana"),
        }
    }
}

/// 32 字节的发送方地址，由各链原生地址按规则归一化得到
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct EmitterAddress([u8; 32]);

impl EmitterAddress {
    pub const LEN: usize = 32;

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// EVM 合约地址左侧补零到 32 字节
    pub fn from_evm(address: &[u8; 20]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(address);
        Self(bytes)
    }

    pub fn from_evm_hex(address: &str) -> Result<Self, Error> {
        Ok(Self::from_evm(&parse_evm_address(address)?))
    }

    pub fn from_solana(pubkey: &Pubkey) -> Self {
        Self(pubkey.to_bytes())
    }

    /// 不带 0x 前缀的 64 位十六进制，守护者 REST 接口使用该格式
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 还原成链上原生地址的字符串形式
    pub fn to_native(&self, chain: ChainId) -> String {
        match chain.family() {
            ChainFamily::Evm => format!("0x{}", hex::encode(&self.0[12..])),
            ChainFamily::Solana => Pubkey::new_from_array(self.0).to_string(),
        }
    }
}

impl fmt::Debug for EmitterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmitterAddress({})", self.to_hex())
    }
}

impl fmt::Display for EmitterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for EmitterAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| Error::Serialization(format!("Invalid emitter address {}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Serialization(format!("Emitter address must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for EmitterAddress {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for EmitterAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EmitterAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 解析 0x 开头的 20 字节 EVM 地址
pub fn parse_evm_address(address: &str) -> Result<[u8; 20], Error> {
    let bytes = hex::decode(address.trim_start_matches("0x"))
        .map_err(|e| Error::Config(format!("Invalid EVM address {}: {}", address, e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Config(format!("EVM address must be 20 bytes: {}", address)))
}

/// 一条跨链消息的唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub chain: ChainId,
    pub emitter: EmitterAddress,
    pub sequence: Sequence,
}

impl MessageId {
    pub fn new(chain: ChainId, emitter: EmitterAddress, sequence: Sequence) -> Self {
        Self { chain, emitter, sequence }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.chain.name(),
            self.emitter.to_native(self.chain),
            self.sequence
        )
    }
}

/// 链适配器提交成功后的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedMessage {
    pub id: MessageId,
    pub transaction: String,
}

/// 中继流程中可能失败的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Submitting,
    AwaitingAttestation,
    Decoding,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Submitting => f.write_str("submitting"),
            Stage::AwaitingAttestation => f.write_str("awaiting attestation"),
            Stage::Decoding => f.write_str("decoding"),
        }
    }
}

/// 随机生成消息 nonce
pub fn create_nonce() -> Nonce {
    rand::random()
}
