use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair, Signer},
    transaction::Transaction,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{chain_adapter::rpc::JsonRpcClient, types::parse_evm_address, Error, UNKNOWN_ERROR};

const VM_REVERT_PREFIX: &str = "VM Exception while processing transaction: revert ";

/// 发往 EVM 钱包的交易
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmTransactionRequest {
    pub to: [u8; 20],
    pub data: Vec<u8>,
}

/// EVM 钱包能力：读取地址与网络、切换网络、发送交易
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvmSigner: Send + Sync {
    async fn address(&self) -> Result<[u8; 20], Error>;

    async fn network_id(&self) -> Result<u64, Error>;

    async fn switch_network(&self, network_id: u64) -> Result<(), Error>;

    /// 返回交易哈希
    async fn send_transaction(&self, tx: EvmTransactionRequest) -> Result<String, Error>;
}

/// Solana 钱包能力：公钥与交易签名
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SolanaSigner: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    async fn sign_transaction(&self, tx: Transaction) -> Result<Transaction, Error>;
}

/// 钱包连接状态，显式 connect / disconnect
pub struct WalletConnection<S: ?Sized> {
    signer: RwLock<Option<Arc<S>>>,
}

impl<S: ?Sized + Send + Sync> Default for WalletConnection<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized + Send + Sync> WalletConnection<S> {
    pub fn new() -> Self {
        Self {
            signer: RwLock::new(None),
        }
    }

    pub fn connected(signer: Arc<S>) -> Self {
        Self {
            signer: RwLock::new(Some(signer)),
        }
    }

    pub async fn connect(&self, signer: Arc<S>) {
        *self.signer.write().await = Some(signer);
        debug!("Wallet connected");
    }

    /// 断开连接，返回之前是否处于连接状态
    pub async fn disconnect(&self) -> bool {
        let was_connected = self.signer.write().await.take().is_some();
        debug!("Wallet disconnected");
        was_connected
    }

    pub async fn is_connected(&self) -> bool {
        self.signer.read().await.is_some()
    }

    pub async fn signer(&self) -> Result<Arc<S>, Error> {
        self.signer
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Wallet("wallet not connected".to_string()))
    }
}

/// 两类链各自的钱包连接
#[derive(Clone, Default)]
pub struct Wallets {
    pub evm: Arc<WalletConnection<dyn EvmSigner>>,
    pub solana: Arc<WalletConnection<dyn SolanaSigner>>,
}

/// 整理钱包返回的错误信息
pub fn clean_wallet_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(reason) = trimmed.strip_prefix(VM_REVERT_PREFIX) {
        return reason.to_string();
    }
    if trimmed.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        trimmed.to_string()
    }
}

/// 通过节点托管账户签名的 EVM 钱包（本地开发链）
pub struct RpcEvmSigner {
    rpc: JsonRpcClient,
    account: Option<[u8; 20]>,
}

impl RpcEvmSigner {
    pub fn new(rpc_url: &str, account: Option<&str>) -> Result<Self, Error> {
        let account = account.map(parse_evm_address).transpose()?;
        Ok(Self {
            rpc: JsonRpcClient::new(rpc_url)?,
            account,
        })
    }

    fn wallet_error(e: Error) -> Error {
        match e {
            Error::Rpc { message, .. } | Error::Chain(message) | Error::Network(message) => {
                Error::Wallet(clean_wallet_error(&message))
            }
            other => other,
        }
    }
}

#[async_trait]
impl EvmSigner for RpcEvmSigner {
    async fn address(&self) -> Result<[u8; 20], Error> {
        if let Some(account) = self.account {
            return Ok(account);
        }
        let accounts: Vec<String> = self
            .rpc
            .call("eth_accounts", json!([]))
            .await
            .map_err(Self::wallet_error)?;
        let first = accounts
            .first()
            .ok_or_else(|| Error::Wallet("node exposes no accounts".to_string()))?;
        parse_evm_address(first)
    }

    async fn network_id(&self) -> Result<u64, Error> {
        let chain_id: String = self
            .rpc
            .call("eth_chainId", json!([]))
            .await
            .map_err(Self::wallet_error)?;
        crate::chain_adapter::rpc::parse_quantity(&chain_id)
    }

    async fn switch_network(&self, network_id: u64) -> Result<(), Error> {
        info!("Requesting wallet switch to network {}", network_id);
        let _: serde_json::Value = self
            .rpc
            .call(
                "wallet_switchEthereumChain",
                json!([{ "chainId": format!("0x{:x}", network_id) }]),
            )
            .await
            .map_err(Self::wallet_error)?;
        Ok(())
    }

    async fn send_transaction(&self, tx: EvmTransactionRequest) -> Result<String, Error> {
        let from = self.address().await?;
        self.rpc
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": format!("0x{}", hex::encode(from)),
                    "to": format!("0x{}", hex::encode(tx.to)),
                    "data": format!("0x{}", hex::encode(&tx.data)),
                }]),
            )
            .await
            .map_err(Self::wallet_error)
    }
}

/// 本地密钥文件签名的 Solana 钱包
pub struct KeypairSigner {
    keypair: Keypair,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let keypair = read_keypair_file(path.as_ref()).map_err(|e| {
            Error::Wallet(format!(
                "Failed to read keypair {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::new(keypair))
    }
}

#[async_trait]
impl SolanaSigner for KeypairSigner {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sign_transaction(&self, mut tx: Transaction) -> Result<Transaction, Error> {
        let blockhash = tx.message.recent_blockhash;
        tx.try_partial_sign(&[&self.keypair], blockhash)
            .map_err(|e| Error::Wallet(clean_wallet_error(&e.to_string())))?;
        Ok(tx)
    }
}
