use messenger_core::{
    types::{ChainId, EmitterAddress, MessageId},
    verify::{guardian_address, GuardianSet},
    Attestation, GuardianSignature,
};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

pub const TEST_TIMESTAMP: u32 = 1_699_276_800;

/// 链上发布的一条消息，守护者据此签名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub chain: ChainId,
    pub emitter: EmitterAddress,
    pub sequence: u64,
    pub nonce: u32,
    pub payload: Vec<u8>,
}

impl Observation {
    pub fn id(&self) -> MessageId {
        MessageId::new(self.chain, self.emitter, self.sequence)
    }

    pub fn to_attestation(&self) -> Attestation {
        Attestation {
            version: 1,
            guardian_set_index: 0,
            signatures: vec![],
            timestamp: TEST_TIMESTAMP,
            nonce: self.nonce,
            emitter_chain: self.chain.to_u16(),
            emitter_address: self.emitter,
            sequence: self.sequence,
            consistency_level: 1,
            payload: self.payload.clone(),
        }
    }
}

/// 测试守护者私钥
#[derive(Clone)]
pub struct GuardianKeys {
    secp: Secp256k1<All>,
    secrets: Vec<SecretKey>,
}

impl GuardianKeys {
    pub fn new(count: usize) -> Self {
        let secrets = (0..count)
            .map(|i| SecretKey::from_slice(&[i as u8 + 1; 32]).unwrap())
            .collect();
        Self {
            secp: Secp256k1::new(),
            secrets,
        }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn addresses(&self) -> Vec<[u8; 20]> {
        self.secrets
            .iter()
            .map(|sk| guardian_address(&PublicKey::from_secret_key(&self.secp, sk)))
            .collect()
    }

    pub fn guardian_set(&self, index: u32) -> GuardianSet {
        GuardianSet::new(index, self.addresses())
    }

    /// 由前 `signers` 个守护者按下标升序签名
    pub fn sign_with(&self, mut attestation: Attestation, signers: usize) -> Attestation {
        let message = Message::from_digest(attestation.digest());
        attestation.signatures = self.secrets[..signers]
            .iter()
            .enumerate()
            .map(|(i, sk)| {
                let (recovery_id, compact) = self
                    .secp
                    .sign_ecdsa_recoverable(&message, sk)
                    .serialize_compact();
                let mut signature = [0u8; 65];
                signature[..64].copy_from_slice(&compact);
                signature[64] = recovery_id.to_i32() as u8;
                GuardianSignature {
                    guardian_index: i as u8,
                    signature,
                }
            })
            .collect();
        attestation
    }

    pub fn sign(&self, attestation: Attestation) -> Attestation {
        self.sign_with(attestation, self.secrets.len())
    }
}
