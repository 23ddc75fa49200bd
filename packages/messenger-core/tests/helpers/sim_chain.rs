use async_trait::async_trait;
use messenger_core::{
    chain_adapter::{
        evm::{log_message_published_topic, EvmRpc, Log, TransactionReceipt},
        solana::{bridge_config_address, emitter_address, SolanaRpc},
    },
    types::{ChainId, EmitterAddress},
    wallet::{EvmSigner, EvmTransactionRequest},
    Error,
};
use solana_sdk::{hash::Hash, pubkey::Pubkey, signature::Signature, transaction::Transaction};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Ledger, Observation};

fn word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn read_word(data: &[u8], index: usize) -> u64 {
    let start = 4 + index * 32;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[start + 24..start + 32]);
    u64::from_be_bytes(bytes)
}

struct EvmState {
    wallet_network: u64,
    refuse_switch: bool,
    next_sequence: u64,
    receipts: HashMap<String, TransactionReceipt>,
}

/// 同时扮演钱包和节点的模拟 EVM 链，Messenger 合约每发一条消息序列号加一
pub struct SimEvmChain {
    pub chain: ChainId,
    pub network_id: u64,
    pub messenger: [u8; 20],
    pub core_bridge: [u8; 20],
    state: Mutex<EvmState>,
    ledger: Ledger,
}

impl SimEvmChain {
    pub fn new(chain: ChainId, network_id: u64, ledger: Ledger) -> Self {
        Self {
            chain,
            network_id,
            messenger: [chain.to_u16() as u8; 20],
            core_bridge: [0xc8; 20],
            state: Mutex::new(EvmState {
                wallet_network: network_id,
                refuse_switch: false,
                next_sequence: 0,
                receipts: HashMap::new(),
            }),
            ledger,
        }
    }

    /// 钱包当前停在另一个网络
    pub fn with_wallet_network(self, network: u64, refuse_switch: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.wallet_network = network;
            state.refuse_switch = refuse_switch;
        }
        self
    }

    pub fn emitter(&self) -> EmitterAddress {
        EmitterAddress::from_evm(&self.messenger)
    }

    pub fn messages_sent(&self) -> u64 {
        self.state.lock().unwrap().next_sequence
    }
}

#[async_trait]
impl EvmSigner for SimEvmChain {
    async fn address(&self) -> Result<[u8; 20], Error> {
        Ok([0x90; 20])
    }

    async fn network_id(&self) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().wallet_network)
    }

    async fn switch_network(&self, network_id: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.refuse_switch {
            state.wallet_network = network_id;
        }
        Ok(())
    }

    async fn send_transaction(&self, tx: EvmTransactionRequest) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if state.wallet_network != self.network_id {
            return Err(Error::Wallet("wrong network".to_string()));
        }
        if tx.to != self.messenger {
            return Err(Error::Wallet("execution reverted".to_string()));
        }

        let nonce = read_word(&tx.data, 1) as u32;
        let len = read_word(&tx.data, 2) as usize;
        let payload = tx.data[4 + 96..4 + 96 + len].to_vec();

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let mut sender = [0u8; 32];
        sender[12..].copy_from_slice(&self.messenger);
        let mut data = Vec::new();
        data.extend_from_slice(&word(sequence));
        data.extend_from_slice(&word(nonce as u64));
        data.extend_from_slice(&word(0x80));
        data.extend_from_slice(&word(1));
        data.extend_from_slice(&word(len as u64));
        data.extend_from_slice(&payload);
        data.resize(data.len() + (32 - len % 32) % 32, 0);

        let tx_hash = format!("0x{:062x}{:02x}", sequence + 1, self.chain.to_u16());
        state.receipts.insert(
            tx_hash.clone(),
            TransactionReceipt {
                transaction_hash: tx_hash.clone(),
                block_number: Some(format!("0x{:x}", sequence + 100)),
                status: Some("0x1".to_string()),
                logs: vec![Log {
                    address: format!("0x{}", hex::encode(self.core_bridge)),
                    topics: vec![
                        format!("0x{}", hex::encode(log_message_published_topic())),
                        format!("0x{}", hex::encode(sender)),
                    ],
                    data: format!("0x{}", hex::encode(data)),
                }],
            },
        );

        self.ledger.push(Observation {
            chain: self.chain,
            emitter: self.emitter(),
            sequence,
            nonce,
            payload,
        });
        Ok(tx_hash)
    }
}

#[async_trait]
impl EvmRpc for SimEvmChain {
    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, Error> {
        Ok(self.state.lock().unwrap().receipts.get(tx_hash).cloned())
    }
}

/// 交易永远不被打包的节点
pub struct PendingReceipts;

#[async_trait]
impl EvmRpc for PendingReceipts {
    async fn transaction_receipt(
        &self,
        _tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, Error> {
        Ok(None)
    }
}

struct SolanaState {
    next_sequence: u64,
    logs: HashMap<Signature, Vec<String>>,
}

/// 模拟的 Solana 节点，执行 Messenger 程序的发送指令
pub struct SimSolana {
    pub messenger: Pubkey,
    pub core_bridge: Pubkey,
    fee: u64,
    state: Mutex<SolanaState>,
    ledger: Ledger,
}

impl SimSolana {
    pub fn new(fee: u64, ledger: Ledger) -> Self {
        Self {
            messenger: Pubkey::new_unique(),
            core_bridge: Pubkey::new_unique(),
            fee,
            state: Mutex::new(SolanaState {
                next_sequence: 0,
                logs: HashMap::new(),
            }),
            ledger,
        }
    }

    pub fn emitter(&self) -> EmitterAddress {
        EmitterAddress::from_solana(&emitter_address(&self.messenger))
    }
}

#[async_trait]
impl SolanaRpc for SimSolana {
    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, Error> {
        if *address != bridge_config_address(&self.core_bridge) {
            return Ok(None);
        }
        let mut data = vec![0u8; 24];
        data[16..].copy_from_slice(&self.fee.to_le_bytes());
        Ok(Some(data))
    }

    async fn latest_blockhash(&self) -> Result<Hash, Error> {
        Ok(Hash::new_unique())
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<Signature, Error> {
        tx.verify()
            .map_err(|e| Error::Chain(format!("signature verification failed: {}", e)))?;

        let keys = &tx.message.account_keys;
        let ix = tx
            .message
            .instructions
            .iter()
            .find(|ix| keys[ix.program_id_index as usize] == self.messenger)
            .ok_or_else(|| Error::Chain("no messenger instruction".to_string()))?;
        let nonce = u32::from_le_bytes(ix.data[1..5].try_into().unwrap());
        let len = u32::from_le_bytes(ix.data[5..9].try_into().unwrap()) as usize;
        let payload = ix.data[9..9 + len].to_vec();

        let mut state = self.state.lock().unwrap();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let signature = tx.signatures[0];
        state.logs.insert(
            signature,
            vec![
                format!("Program {} invoke [1]", self.messenger),
                format!("Program {} invoke [2]", self.core_bridge),
                format!("Program log: Sequence: {}", sequence),
                format!("Program {} success", self.messenger),
            ],
        );

        self.ledger.push(Observation {
            chain: ChainId::Solana,
            emitter: self.emitter(),
            sequence,
            nonce,
            payload,
        });
        Ok(signature)
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<Result<(), String>>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .contains_key(signature)
            .then_some(Ok(())))
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(signature)
            .cloned()
            .unwrap_or_default())
    }
}
