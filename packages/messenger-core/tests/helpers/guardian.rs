use async_trait::async_trait;
use messenger_core::{attestation::AttestationSource, types::MessageId, Error};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::{GuardianKeys, Observation};

/// 各模拟链共享的已发布消息记录
#[derive(Clone, Default)]
pub struct Ledger {
    entries: Arc<Mutex<Vec<Observation>>>,
}

impl Ledger {
    pub fn push(&self, observation: Observation) {
        self.entries.lock().unwrap().push(observation);
    }

    pub fn find(&self, id: &MessageId) -> Option<Observation> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id() == *id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// 观察账本并签名的模拟守护者网络
pub struct SimGuardian {
    keys: GuardianKeys,
    ledger: Ledger,
    poll_interval: Duration,
    max_polls: u32,
}

impl SimGuardian {
    pub fn new(keys: GuardianKeys, ledger: Ledger) -> Self {
        Self {
            keys,
            ledger,
            poll_interval: Duration::from_millis(10),
            max_polls: 50,
        }
    }

    /// 永远等不到签名
    pub fn silent(keys: GuardianKeys) -> Self {
        Self {
            max_polls: u32::MAX,
            ..Self::new(keys, Ledger::default())
        }
    }
}

#[async_trait]
impl AttestationSource for SimGuardian {
    async fn fetch(&self, id: &MessageId) -> Result<Vec<u8>, Error> {
        let started = Instant::now();
        for _ in 0..self.max_polls {
            if let Some(observation) = self.ledger.find(id) {
                return Ok(self.keys.sign(observation.to_attestation()).encode());
            }
            sleep(self.poll_interval).await;
        }
        Err(Error::Timeout {
            attempts: self.max_polls,
            elapsed: started.elapsed(),
        })
    }
}
