pub mod attestation;
pub mod chain_adapter;
pub mod config;
pub mod relayer;
pub mod types;
pub mod vaa;
pub mod verify;
pub mod wallet;

use std::time::Duration;

pub use config::Config;
pub use types::{
    ChainFamily, ChainId, EmitterAddress, MessageId, Nonce, Sequence, Stage, SubmittedMessage,
};
pub use vaa::{Attestation, DecodeError, GuardianSignature};

/// 底层错误没有任何描述时使用的兜底文案
pub const UNKNOWN_ERROR: &str = "An unknown error occurred";

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    /// 节点返回的 JSON-RPC 错误，`message` 保持节点原文
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Network mismatch: expected network {expected}, wallet is on {actual}")]
    NetworkMismatch { expected: u64, actual: u64 },

    #[error("Submit failed: {0}")]
    SubmitFailed(String),

    #[error("Log parse failed: {0}")]
    LogParseFailed(String),

    #[error("Timed out waiting for attestation after {attempts} attempts ({elapsed:?})")]
    Timeout { attempts: u32, elapsed: Duration },

    #[error("All attestation endpoints unreachable after {attempts} attempts: {last_error}")]
    AllEndpointsUnreachable { attempts: u32, last_error: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Verification error: {0}")]
    Verification(String),

    #[error("Relay cancelled")]
    Cancelled,
}

impl Error {
    /// 错误所属的中继阶段，配置类错误不属于任何阶段
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::NetworkMismatch { .. }
            | Error::SubmitFailed(_)
            | Error::LogParseFailed(_)
            | Error::Wallet(_) => Some(Stage::Submitting),
            Error::Timeout { .. } | Error::AllEndpointsUnreachable { .. } => {
                Some(Stage::AwaitingAttestation)
            }
            Error::Decode(_) | Error::Verification(_) => Some(Stage::Decoding),
            Error::Config(_)
            | Error::Chain(_)
            | Error::Network(_)
            | Error::Rpc { .. }
            | Error::Serialization(_)
            | Error::Cancelled => None,
        }
    }
}
