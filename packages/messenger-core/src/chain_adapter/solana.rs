use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::{
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_instruction, system_program, sysvar,
    transaction::Transaction,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::sleep;

use super::{rpc::JsonRpcClient, ChainAdapter};
use crate::{
    config::{ChainConfig, ConfirmationConfig},
    types::{ChainId, EmitterAddress, MessageId, Nonce, SubmittedMessage},
    wallet::{SolanaSigner, WalletConnection},
    Error,
};

const SEQUENCE_LOG_PREFIX: &str = "Program log: Sequence: ";
/// 核心桥配置账户中 fee 字段的位置
const BRIDGE_FEE_OFFSET: usize = 16;
const SEND_MESSAGE_TAG: u8 = 0;

/// Solana 节点接口，只包含提交消息需要的调用
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SolanaRpc: Send + Sync {
    /// 账户不存在时返回 `None`
    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, Error>;

    async fn latest_blockhash(&self) -> Result<Hash, Error>;

    async fn send_transaction(&self, tx: &Transaction) -> Result<Signature, Error>;

    /// `None` 表示尚未确认；`Some(Err)` 携带链上执行错误
    async fn signature_status(&self, signature: &Signature)
        -> Result<Option<Result<(), String>>, Error>;

    async fn transaction_logs(&self, signature: &Signature) -> Result<Vec<String>, Error>;
}

#[derive(Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Deserialize)]
struct AccountInfo {
    data: (String, String),
}

#[derive(Deserialize)]
struct LatestBlockhash {
    blockhash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    confirmation_status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    #[serde(default)]
    log_messages: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ConfirmedTransaction {
    meta: Option<TransactionMeta>,
}

#[async_trait]
impl SolanaRpc for JsonRpcClient {
    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, Error> {
        let info: WithContext<Option<AccountInfo>> = self
            .call(
                "getAccountInfo",
                json!([address.to_string(), { "encoding": "base64", "commitment": "confirmed" }]),
            )
            .await?;
        info.value
            .map(|account| {
                STANDARD.decode(account.data.0).map_err(|e| {
                    Error::Serialization(format!("Invalid account data for {}: {}", address, e))
                })
            })
            .transpose()
    }

    async fn latest_blockhash(&self) -> Result<Hash, Error> {
        let latest: WithContext<LatestBlockhash> = self
            .call("getLatestBlockhash", json!([{ "commitment": "confirmed" }]))
            .await?;
        Hash::from_str(&latest.value.blockhash)
            .map_err(|e| Error::Serialization(format!("Invalid blockhash: {}", e)))
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<Signature, Error> {
        let wire = bincode::serialize(tx)
            .map_err(|e| Error::Serialization(format!("Failed to serialize transaction: {}", e)))?;
        let signature: String = self
            .call(
                "sendTransaction",
                json!([
                    STANDARD.encode(wire),
                    { "encoding": "base64", "preflightCommitment": "confirmed" }
                ]),
            )
            .await?;
        Signature::from_str(&signature)
            .map_err(|e| Error::Serialization(format!("Invalid signature {}: {}", signature, e)))
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<Result<(), String>>, Error> {
        let statuses: WithContext<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature.to_string()], { "searchTransactionHistory": true }]),
            )
            .await?;
        let Some(Some(status)) = statuses.value.into_iter().next() else {
            return Ok(None);
        };
        if let Some(err) = status.err {
            return Ok(Some(Err(err.to_string())));
        }
        match status.confirmation_status.as_deref() {
            Some("confirmed") | Some("finalized") => Ok(Some(Ok(()))),
            _ => Ok(None),
        }
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Vec<String>, Error> {
        let tx: Option<ConfirmedTransaction> = self
            .call(
                "getTransaction",
                json!([
                    signature.to_string(),
                    {
                        "encoding": "json",
                        "commitment": "confirmed",
                        "maxSupportedTransactionVersion": 0
                    }
                ]),
            )
            .await?;
        Ok(tx
            .and_then(|tx| tx.meta)
            .and_then(|meta| meta.log_messages)
            .unwrap_or_default())
    }
}

pub fn bridge_config_address(core_bridge: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[b"Bridge"], core_bridge).0
}

pub fn fee_collector_address(core_bridge: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[b"fee_collector"], core_bridge).0
}

pub fn sequence_address(core_bridge: &Pubkey, emitter: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[b"Sequence", emitter.as_ref()], core_bridge).0
}

/// Messenger 程序的发送方 PDA
pub fn emitter_address(messenger: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[b"emitter"], messenger).0
}

/// 从核心桥配置账户读取消息费用（lamports，小端）
pub fn parse_bridge_fee(data: &[u8]) -> Result<u64, Error> {
    let bytes = data
        .get(BRIDGE_FEE_OFFSET..BRIDGE_FEE_OFFSET + 8)
        .ok_or_else(|| {
            Error::SubmitFailed(format!("Bridge config account too short: {} bytes", data.len()))
        })?;
    let mut fee = [0u8; 8];
    fee.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(fee))
}

pub fn parse_sequence_from_logs(logs: &[String]) -> Result<u64, Error> {
    let line = logs
        .iter()
        .find_map(|line| line.strip_prefix(SEQUENCE_LOG_PREFIX))
        .ok_or_else(|| Error::LogParseFailed("No sequence in transaction logs".to_string()))?;
    line.trim()
        .parse()
        .map_err(|e| Error::LogParseFailed(format!("Invalid sequence {}: {}", line, e)))
}

fn submit_failed(e: Error) -> Error {
    match e {
        Error::Rpc { message, .. }
        | Error::Wallet(message)
        | Error::Chain(message)
        | Error::Network(message) => Error::SubmitFailed(message),
        Error::SubmitFailed(msg) => Error::SubmitFailed(msg),
        other => Error::SubmitFailed(other.to_string()),
    }
}

pub struct SolanaAdapter {
    messenger: Pubkey,
    core_bridge: Pubkey,
    emitter: Pubkey,
    wallet: Arc<WalletConnection<dyn SolanaSigner>>,
    rpc: Arc<dyn SolanaRpc>,
    confirmation: ConfirmationConfig,
}

impl SolanaAdapter {
    pub fn new(
        messenger: Pubkey,
        core_bridge: Pubkey,
        wallet: Arc<WalletConnection<dyn SolanaSigner>>,
        rpc: Arc<dyn SolanaRpc>,
    ) -> Self {
        Self {
            messenger,
            core_bridge,
            emitter: emitter_address(&messenger),
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
        wallet: Arc<WalletConnection<dyn SolanaSigner>>,
        rpc: Arc<dyn SolanaRpc>,
    ) -> Result<Self, Error> {
        let parse = |address: &str| {
            Pubkey::from_str(address)
                .map_err(|e| Error::Config(format!("Invalid Solana address {}: {}", address, e)))
        };
        Ok(Self::new(
            parse(&config.messenger_address)?,
            parse(&config.core_bridge_address)?,
            wallet,
            rpc,
        )
        .with_confirmation(config.confirmation.clone()))
    }

    /// 费用为 0 时不需要转账指令
    pub async fn bridge_fee_instruction(
        &self,
        payer: &Pubkey,
    ) -> Result<Option<Instruction>, Error> {
        let config = bridge_config_address(&self.core_bridge);
        let data = self.rpc.account_data(&config).await?.ok_or_else(|| {
            Error::SubmitFailed(format!("Core bridge config {} not found", config))
        })?;
        let fee = parse_bridge_fee(&data)?;
        debug!("Core bridge message fee: {} lamports", fee);
        if fee == 0 {
            return Ok(None);
        }
        Ok(Some(system_instruction::transfer(
            payer,
            &fee_collector_address(&self.core_bridge),
            fee,
        )))
    }

    pub fn send_message_instruction(
        &self,
        payer: &Pubkey,
        message: &Pubkey,
        payload: &[u8],
        nonce: Nonce,
    ) -> Instruction {
        let mut data = Vec::with_capacity(9 + payload.len());
        data.push(SEND_MESSAGE_TAG);
        data.extend_from_slice(&nonce.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(payload);

        Instruction {
            program_id: self.messenger,
            accounts: vec![
                AccountMeta::new(*payer, true),
                AccountMeta::new(bridge_config_address(&self.core_bridge), false),
                AccountMeta::new(*message, true),
                AccountMeta::new_readonly(self.emitter, false),
                AccountMeta::new(sequence_address(&self.core_bridge, &self.emitter), false),
                AccountMeta::new(fee_collector_address(&self.core_bridge), false),
                AccountMeta::new_readonly(sysvar::clock::id(), false),
                AccountMeta::new_readonly(sysvar::rent::id(), false),
                AccountMeta::new_readonly(system_program::id(), false),
                AccountMeta::new_readonly(self.core_bridge, false),
            ],
            data,
        }
    }

    async fn wait_for_confirmation(&self, signature: &Signature) -> Result<(), Error> {
        let max_polls = self.confirmation.max_polls;
        let mut last_error = None;

        for poll in 1..=max_polls {
            match self.rpc.signature_status(signature).await {
                Ok(Some(Ok(()))) => return Ok(()),
                Ok(Some(Err(e))) => {
                    return Err(Error::SubmitFailed(format!(
                        "Transaction {} failed: {}",
                        signature, e
                    )))
                }
                Ok(None) => debug!("Transaction {} pending ({}/{})", signature, poll, max_polls),
                Err(e) => {
                    warn!("Status poll {}/{} for {} failed: {}", poll, max_polls, signature, e);
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
                signature, max_polls, e
            ),
            None => format!("Transaction {} not confirmed after {} polls", signature, max_polls),
        }))
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn chain_id(&self) -> ChainId {
        ChainId::Solana
    }

    fn emitter_address(&self) -> EmitterAddress {
        EmitterAddress::from_solana(&self.emitter)
    }

    async fn send(&self, payload: &[u8], nonce: Nonce) -> Result<String, Error> {
        let signer = self.wallet.signer().await?;
        let payer = signer.pubkey();
        let message = Keypair::new();

        let mut instructions = Vec::with_capacity(2);
        let fee_ix = self
            .bridge_fee_instruction(&payer)
            .await
            .map_err(submit_failed)?;
        if let Some(fee_ix) = fee_ix {
            instructions.push(fee_ix);
        }
        instructions.push(self.send_message_instruction(&payer, &message.pubkey(), payload, nonce));

        let blockhash = self.rpc.latest_blockhash().await.map_err(submit_failed)?;
        let mut tx = Transaction::new_with_payer(&instructions, Some(&payer));
        tx.try_partial_sign(&[&message], blockhash)
            .map_err(|e| Error::SubmitFailed(format!("Failed to sign message account: {}", e)))?;
        let tx = signer.sign_transaction(tx).await.map_err(submit_failed)?;

        let signature = self.rpc.send_transaction(&tx).await.map_err(submit_failed)?;
        info!("Submitted message to Solana in transaction {}", signature);
        Ok(signature.to_string())
    }

    async fn confirm(&self, transaction: &str) -> Result<SubmittedMessage, Error> {
        let signature = Signature::from_str(transaction).map_err(|e| {
            Error::SubmitFailed(format!("Invalid transaction signature {}: {}", transaction, e))
        })?;
        self.wait_for_confirmation(&signature).await?;

        let logs = self
            .rpc
            .transaction_logs(&signature)
            .await
            .map_err(|e| Error::LogParseFailed(e.to_string()))?;
        let sequence = parse_sequence_from_logs(&logs)?;
        info!("Transaction {} published sequence {}", signature, sequence);

        Ok(SubmittedMessage {
            id: MessageId::new(ChainId::Solana, self.emitter_address(), sequence),
            transaction: signature.to_string(),
        })
    }
}
