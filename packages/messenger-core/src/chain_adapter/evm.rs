use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::time::sleep;

use super::{rpc::JsonRpcClient, ChainAdapter};
use crate::{
    config::{ChainConfig, ConfirmationConfig},
    types::{parse_evm_address, ChainId, EmitterAddress, MessageId, Nonce, SubmittedMessage},
    vaa::keccak256,
    wallet::{EvmSigner, EvmTransactionRequest, WalletConnection},
    Error,
};

/// 示例 Messenger 合约的发送函数
pub const SEND_STR_SIGNATURE: &str = "sendStr(bytes,uint32)";
/// 核心桥在发布消息时触发的事件
pub const LOG_MESSAGE_PUBLISHED_SIGNATURE: &str =
    "LogMessagePublished(address,uint64,uint32,bytes,uint8)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub block_number: Option<String>,
    /// "0x1" 成功，"0x0" 回滚
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl TransactionReceipt {
    pub fn reverted(&self) -> bool {
        self.status.as_deref() == Some("0x0")
    }
}

/// EVM 节点的只读接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvmRpc: Send + Sync {
    /// 交易尚未打包时返回 `None`
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, Error>;
}

#[async_trait]
impl EvmRpc for JsonRpcClient {
    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, Error> {
        self.call("eth_getTransactionReceipt", json!([tx_hash])).await
    }
}

pub fn log_message_published_topic() -> [u8; 32] {
    keccak256(LOG_MESSAGE_PUBLISHED_SIGNATURE.as_bytes())
}

fn abi_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// ABI 编码 `sendStr(bytes payload, uint32 nonce)` 的调用数据
pub fn encode_send_str(payload: &[u8], nonce: Nonce) -> Vec<u8> {
    let padding = (32 - payload.len() % 32) % 32;
    let mut data = Vec::with_capacity(4 + 3 * 32 + payload.len() + padding);
    data.extend_from_slice(&keccak256(SEND_STR_SIGNATURE.as_bytes())[..4]);
    // bytes 参数位于两个头部字之后
    data.extend_from_slice(&abi_word(64));
    data.extend_from_slice(&abi_word(nonce as u64));
    data.extend_from_slice(&abi_word(payload.len() as u64));
    data.extend_from_slice(payload);
    data.resize(data.len() + padding, 0);
    data
}

fn decode_hex(value: &str) -> Result<Vec<u8>, Error> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| Error::LogParseFailed(format!("Invalid hex {}: {}", value, e)))
}

/// 从回执中找出核心桥为 `emitter` 发布的消息事件并读取序列号
pub fn parse_sequence_from_receipt(
    receipt: &TransactionReceipt,
    core_bridge: &[u8; 20],
    emitter: &[u8; 20],
) -> Result<u64, Error> {
    let topic = log_message_published_topic();

    for log in &receipt.logs {
        let Ok(address) = parse_evm_address(&log.address) else {
            continue;
        };
        if &address != core_bridge {
            continue;
        }
        match log.topics.first() {
            Some(first) if decode_hex(first)? == topic => {}
            _ => continue,
        }
        // sender 是 indexed 参数
        if let Some(sender) = log.topics.get(1) {
            let sender = decode_hex(sender)?;
            if sender.len() != 32 || &sender[12..] != emitter.as_slice() {
                continue;
            }
        }

        let data = decode_hex(&log.data)?;
        if data.len() < 32 {
            return Err(Error::LogParseFailed(format!(
                "LogMessagePublished data too short: {} bytes",
                data.len()
            )));
        }
        if data[..24].iter().any(|b| *b != 0) {
            return Err(Error::LogParseFailed("Sequence does not fit in u64".to_string()));
        }
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&data[24..32]);
        return Ok(u64::from_be_bytes(sequence));
    }

    Err(Error::LogParseFailed(format!(
        "No LogMessagePublished event in transaction {}",
        receipt.transaction_hash
    )))
}

pub struct EvmAdapter {
    chain: ChainId,
    network_id: u64,
    messenger: [u8; 20],
    core_bridge: [u8; 20],
    wallet: Arc<WalletConnection<dyn EvmSigner>>,
    rpc: Arc<dyn EvmRpc>,
    confirmation: ConfirmationConfig,
}

impl EvmAdapter {
    pub fn new(
        chain: ChainId,
        network_id: u64,
        messenger: [u8; 20],
        core_bridge: [u8; 20],
        wallet: Arc<WalletConnection<dyn EvmSigner>>,
        rpc: Arc<dyn EvmRpc>,
    ) -> Self {
        Self {
            chain,
            network_id,
            messenger,
            core_bridge,
            wallet,
            rpc,
            confirmation: ConfirmationConfig::default(),
        }
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationConfig) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn from_config(
        config: &ChainConfig,
        wallet: Arc<WalletConnection<dyn EvmSigner>>,
        rpc: Arc<dyn EvmRpc>,
    ) -> Result<Self, Error> {
        let network_id = config.network_id.ok_or_else(|| {
            Error::Config(format!("EVM chain {} requires network_id", config.chain_id))
        })?;
        Ok(Self::new(
            config.chain_id,
            network_id,
            parse_evm_address(&config.messenger_address)?,
            parse_evm_address(&config.core_bridge_address)?,
            wallet,
            rpc,
        )
        .with_confirmation(config.confirmation.clone()))
    }

    /// 确认钱包处于目标网络，必要时请求切换并重新检查
    async fn ensure_network(&self, signer: &dyn EvmSigner) -> Result<(), Error> {
        let current = signer.network_id().await?;
        if current == self.network_id {
            return Ok(());
        }

        info!(
            "Wallet on network {}, switching to {} for {}",
            current, self.network_id, self.chain
        );
        if let Err(e) = signer.switch_network(self.network_id).await {
            warn!("Network switch request failed: {}", e);
        }

        let actual = signer.network_id().await?;
        if actual != self.network_id {
            error!(
                "Wallet did not switch networks: expected {}, got {}",
                self.network_id, actual
            );
            return Err(Error::NetworkMismatch {
                expected: self.network_id,
                actual,
            });
        }
        Ok(())
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt, Error> {
        let max_polls = self.confirmation.max_polls;
        let mut last_error = None;

        for poll in 1..=max_polls {
            match self.rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.block_number.is_some() => return Ok(receipt),
                Ok(_) => debug!("Transaction {} pending ({}/{})", tx_hash, poll, max_polls),
                Err(e) => {
                    warn!("Receipt poll {}/{} for {} failed: {}", poll, max_polls, tx_hash, e);
                    last_error = Some(e);
                }
            }
            if poll < max_polls {
                sleep(self.confirmation.poll_interval()).await;
            }
        }

        Err(Error::SubmitFailed(match last_error {
            Some(e) => format!(
                "Transaction {} not confirmed after {} polls: {}",
                tx_hash, max_polls, e
            ),
            None => format!("Transaction {} not confirmed after {} polls", tx_hash, max_polls),
        }))
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_id(&self) -> ChainId {
        self.chain
    }

    fn emitter_address(&self) -> EmitterAddress {
        EmitterAddress::from_evm(&self.messenger)
    }

    async fn send(&self, payload: &[u8], nonce: Nonce) -> Result<String, Error> {
        let signer = self.wallet.signer().await?;
        self.ensure_network(signer.as_ref()).await?;

        let request = EvmTransactionRequest {
            to: self.messenger,
            data: encode_send_str(payload, nonce),
        };
        let tx_hash = signer.send_transaction(request).await.map_err(|e| match e {
            Error::Wallet(msg) => Error::SubmitFailed(msg),
            other => Error::SubmitFailed(other.to_string()),
        })?;
        info!("Submitted message to {} in transaction {}", self.chain, tx_hash);
        Ok(tx_hash)
    }

    async fn confirm(&self, tx_hash: &str) -> Result<SubmittedMessage, Error> {
        let receipt = self.wait_for_receipt(tx_hash).await?;
        if receipt.reverted() {
            return Err(Error::SubmitFailed(format!("Transaction {} reverted", tx_hash)));
        }

        let sequence = parse_sequence_from_receipt(&receipt, &self.core_bridge, &self.messenger)?;
        info!("Transaction {} published sequence {}", tx_hash, sequence);

        Ok(SubmittedMessage {
            id: MessageId::new(self.chain, self.emitter_address(), sequence),
            transaction: tx_hash.to_string(),
        })
    }
}
