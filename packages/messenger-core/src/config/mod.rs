use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{parse_evm_address, ChainFamily, ChainId};
use crate::Error;

/// 签名方设置：EVM 使用节点托管账户，Solana 使用本地密钥文件
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SignerConfig {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub keypair_path: Option<PathBuf>,
}

/// 交易确认轮询
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConfirmationConfig {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_polls: 60,
        }
    }
}

impl ConfirmationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub name: String,
    pub family: ChainFamily,
    pub rpc_url: String,
    /// 发送消息的合约（EVM）或程序（Solana）地址
    pub messenger_address: String,
    /// 核心桥合约或程序地址
    pub core_bridge_address: String,
    /// EVM 钱包所在网络的 chainId
    #[serde(default)]
    pub network_id: Option<u64>,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_max_attempts() -> u32 {
    20
}

fn default_deadline_secs() -> u64 {
    120
}

/// 守护者 REST 接口与重试预算
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AttestationConfig {
    pub hosts: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GuardianSetConfig {
    pub index: u32,
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub attestation: AttestationConfig,
    #[serde(default)]
    pub guardian_set: Option<GuardianSetConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&config_str)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            serde_json::from_str(&config_str)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chains.is_empty() {
            return Err(Error::Config("At least one chain must be configured".to_string()));
        }

        // 验证链配置
        let mut seen = Vec::new();
        for chain in &self.chains {
            if seen.contains(&chain.chain_id) {
                return Err(Error::Config(format!("Duplicate chain: {}", chain.chain_id)));
            }
            seen.push(chain.chain_id);

            if chain.family != chain.chain_id.family() {
                return Err(Error::Config(format!(
                    "Chain {} belongs to the {} family, not {}",
                    chain.chain_id,
                    chain.chain_id.family(),
                    chain.family
                )));
            }
            if chain.rpc_url.is_empty() {
                return Err(Error::Config(format!("Missing rpc_url for chain {}", chain.chain_id)));
            }
            if chain.confirmation.max_polls == 0 {
                return Err(Error::Config(format!(
                    "Confirmation max_polls must be greater than 0 for chain {}",
                    chain.chain_id
                )));
            }

            match chain.family {
                ChainFamily::Evm => {
                    if chain.network_id.is_none() {
                        return Err(Error::Config(format!(
                            "EVM chain {} requires network_id",
                            chain.chain_id
                        )));
                    }
                    parse_evm_address(&chain.messenger_address)?;
                    parse_evm_address(&chain.core_bridge_address)?;
                }
                ChainFamily::Solana => {
                    for address in [&chain.messenger_address, &chain.core_bridge_address] {
                        address.parse::<solana_sdk::pubkey::Pubkey>().map_err(|e| {
                            Error::Config(format!("Invalid Solana address {}: {}", address, e))
                        })?;
                    }
                }
            }
        }

        // 验证证明服务配置
        if self.attestation.hosts.is_empty() {
            return Err(Error::Config("At least one attestation host is required".to_string()));
        }
        if self.attestation.max_attempts == 0 {
            return Err(Error::Config(
                "Attestation max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.attestation.deadline_secs == 0 {
            return Err(Error::Config("Attestation deadline must be greater than 0".to_string()));
        }
        if self.attestation.max_delay_ms < self.attestation.initial_delay_ms {
            return Err(Error::Config(
                "Attestation max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }

        // 验证守护者集合
        if let Some(guardian_set) = &self.guardian_set {
            if guardian_set.keys.is_empty() {
                return Err(Error::Config("Guardian set must contain at least one key".to_string()));
            }
            if guardian_set.keys.len() > crate::vaa::MAX_GUARDIANS {
                return Err(Error::Config(format!(
                    "Guardian set has {} keys, at most {} allowed",
                    guardian_set.keys.len(),
                    crate::vaa::MAX_GUARDIANS
                )));
            }
            for key in &guardian_set.keys {
                if hex::decode(key.trim_start_matches("0x")).map(|b| b.len()) != Ok(20) {
                    return Err(Error::Config(format!("Invalid guardian key: {}", key)));
                }
            }
        }

        Ok(())
    }

    pub fn get_chain_config(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}
