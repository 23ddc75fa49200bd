use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    config::ChainConfig,
    types::{ChainFamily, ChainId, EmitterAddress, Nonce, SubmittedMessage},
    wallet::Wallets,
    Error,
};

/// 链适配器特征：向链上提交一条消息并取回其序列号
///
/// 提交分两步：`send` 广播交易并返回交易标识，之后费用已经花出；
/// `confirm` 等待该交易确认并从日志中解析序列号。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// 本适配器发出的消息使用的发送方地址
    fn emitter_address(&self) -> EmitterAddress;

    /// 广播消息交易，返回 EVM 交易哈希或 Solana 交易签名
    async fn send(&self, payload: &[u8], nonce: Nonce) -> Result<String, Error>;

    /// 等待 `send` 返回的交易确认并解析序列号
    async fn confirm(&self, transaction: &str) -> Result<SubmittedMessage, Error>;
}

/// 广播并等待确认
pub async fn submit(
    adapter: &dyn ChainAdapter,
    payload: &[u8],
    nonce: Nonce,
) -> Result<SubmittedMessage, Error> {
    let transaction = adapter.send(payload, nonce).await?;
    adapter.confirm(&transaction).await
}

/// 链适配器工厂，用于创建不同链的适配器实例
pub trait ChainAdapterFactory {
    fn create_adapter(&self, config: &ChainConfig) -> Result<Arc<dyn ChainAdapter>, Error>;
}

/// 通过 JSON-RPC 节点与注入的钱包连接创建适配器
pub struct DefaultChainAdapterFactory {
    wallets: Wallets,
}

impl DefaultChainAdapterFactory {
    pub fn new(wallets: Wallets) -> Self {
        Self { wallets }
    }
}

impl ChainAdapterFactory for DefaultChainAdapterFactory {
    fn create_adapter(&self, config: &ChainConfig) -> Result<Arc<dyn ChainAdapter>, Error> {
        let rpc = Arc::new(rpc::JsonRpcClient::new(&config.rpc_url)?);
        match config.family {
            ChainFamily::Evm => {
                let adapter = EvmAdapter::from_config(config, self.wallets.evm.clone(), rpc)?;
                Ok(Arc::new(adapter))
            }
            ChainFamily::Solana => {
                let adapter = SolanaAdapter::from_config(config, self.wallets.solana.clone(), rpc)?;
                Ok(Arc::new(adapter))
            }
        }
    }
}

/// 按配置推导发送方地址，不需要连接节点
pub fn chain_emitter(config: &ChainConfig) -> Result<EmitterAddress, Error> {
    match config.family {
        ChainFamily::Evm => EmitterAddress::from_evm_hex(&config.messenger_address),
        ChainFamily::Solana => {
            let program = config
                .messenger_address
                .parse::<solana_sdk::pubkey::Pubkey>()
                .map_err(|e| {
                    Error::Config(format!(
                        "Invalid Solana address {}: {}",
                        config.messenger_address, e
                    ))
                })?;
            Ok(EmitterAddress::from_solana(&solana::emitter_address(&program)))
        }
    }
}

/// 按链查找适配器的表
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(
        factory: &dyn ChainAdapterFactory,
        configs: &[ChainConfig],
    ) -> Result<Self, Error> {
        let mut registry = Self::new();
        for config in configs {
            let adapter = factory.create_adapter(config)?;
            info!(
                "Registered {} adapter for {} (emitter {})",
                config.family,
                config.chain_id,
                adapter.emitter_address()
            );
            registry.insert(adapter);
        }
        Ok(registry)
    }

    /// 以适配器自身的链标识注册，覆盖已有条目
    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain_id(), adapter);
    }

    pub fn get(&self, chain: ChainId) -> Result<Arc<dyn ChainAdapter>, Error> {
        self.adapters
            .get(&chain)
            .cloned()
            .ok_or_else(|| Error::Config(format!("No adapter registered for chain {}", chain)))
    }

    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.adapters.keys().copied().collect();
        chains.sort();
        chains
    }
}

// 注册所有支持的链适配器
pub mod evm;
pub mod rpc;
pub mod solana;

// 导出具体的适配器实现
pub use evm::EvmAdapter;
pub use solana::SolanaAdapter;
