//! VAA（守护者签名的跨链证明）的二进制编解码。
//!
//! 布局（大端序）：
//! `version u8 | guardian_set_index u32 | len_signatures u8 | signatures |
//! timestamp u32 | nonce u32 | emitter_chain u16 | emitter_address [u8; 32] |
//! sequence u64 | consistency_level u8 | payload`，
//! 每个签名为 `guardian_index u8 | signature [u8; 65]`。

use sha3::{Digest, Keccak256};
use std::fmt;

use crate::types::{ChainId, EmitterAddress, MessageId, Sequence};

pub const VAA_VERSION: u8 = 1;
/// 守护者集合的最大成员数
pub const MAX_GUARDIANS: usize = 19;
pub const SIGNATURE_LEN: usize = 65;

const SIGNATURE_ENTRY_LEN: usize = 1 + SIGNATURE_LEN;
const BODY_FIXED_LEN: usize = 4 + 4 + 2 + 32 + 8 + 1;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Version,
    GuardianSetIndex,
    SignatureCount,
    Signature,
    Timestamp,
    Nonce,
    EmitterChain,
    EmitterAddress,
    Sequence,
    ConsistencyLevel,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Version => "version",
            Field::GuardianSetIndex => "guardian_set_index",
            Field::SignatureCount => "signature_count",
            Field::Signature => "signature",
            Field::Timestamp => "timestamp",
            Field::Nonce => "nonce",
            Field::EmitterChain => "emitter_chain",
            Field::EmitterAddress => "emitter_address",
            Field::Sequence => "sequence",
            Field::ConsistencyLevel => "consistency_level",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("input truncated at {field}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        field: Field,
        needed: usize,
        remaining: usize,
    },

    #[error("declared {declared} signatures but the remaining bytes hold at most {available}")]
    SignatureCountMismatch { declared: usize, available: usize },

    #[error("declared {declared} signatures, guardian set has {set_size} members")]
    TooManySignatures { declared: usize, set_size: usize },

    #[error("signature {position} names guardian {index}, guardian set has {set_size} members")]
    GuardianIndexOutOfRange {
        position: usize,
        index: u8,
        set_size: usize,
    },

    #[error("unsupported VAA version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSignature {
    pub guardian_index: u8,
    /// r(32) | s(32) | recovery id(1)
    pub signature: [u8; SIGNATURE_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub version: u8,
    pub guardian_set_index: u32,
    pub signatures: Vec<GuardianSignature>,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: u16,
    pub emitter_address: EmitterAddress,
    pub sequence: Sequence,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

impl Attestation {
    /// 按最大守护者集合规模解码
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Decoder::default().decode(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let mut bytes =
            Vec::with_capacity(6 + self.signatures.len() * SIGNATURE_ENTRY_LEN + body.len());
        bytes.push(self.version);
        bytes.extend_from_slice(&self.guardian_set_index.to_be_bytes());
        bytes.push(self.signatures.len() as u8);
        for sig in &self.signatures {
            bytes.push(sig.guardian_index);
            bytes.extend_from_slice(&sig.signature);
        }
        bytes.extend_from_slice(&body);
        bytes
    }

    /// 守护者签名覆盖的消息体
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(BODY_FIXED_LEN + self.payload.len());
        body.extend_from_slice(&self.timestamp.to_be_bytes());
        body.extend_from_slice(&self.nonce.to_be_bytes());
        body.extend_from_slice(&self.emitter_chain.to_be_bytes());
        body.extend_from_slice(self.emitter_address.as_bytes());
        body.extend_from_slice(&self.sequence.to_be_bytes());
        body.push(self.consistency_level);
        body.extend_from_slice(&self.payload);
        body
    }

    /// keccak256(body)，即 VAA 哈希
    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.body())
    }

    /// 守护者实际签名的摘要：keccak256(keccak256(body))
    pub fn digest(&self) -> [u8; 32] {
        keccak256(&self.hash())
    }

    pub fn emitter_chain_id(&self) -> Option<ChainId> {
        ChainId::try_from(self.emitter_chain).ok()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.emitter_chain_id()
            .map(|chain| MessageId::new(chain, self.emitter_address, self.sequence))
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 解码入口
pub fn decode(bytes: &[u8]) -> Result<Attestation, DecodeError> {
    Attestation::decode(bytes)
}

/// 带守护者集合规模的解码器，签名里的守护者下标必须小于该规模
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    guardian_set_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            guardian_set_size: MAX_GUARDIANS,
        }
    }
}

impl Decoder {
    pub fn new(guardian_set_size: usize) -> Self {
        Self { guardian_set_size }
    }

    pub fn guardian_set_size(&self) -> usize {
        self.guardian_set_size
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Attestation, DecodeError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8(Field::Version)?;
        if version != VAA_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let guardian_set_index = reader.u32(Field::GuardianSetIndex)?;
        let declared = reader.u8(Field::SignatureCount)? as usize;

        let available = reader.remaining() / SIGNATURE_ENTRY_LEN;
        if declared > available {
            return Err(DecodeError::SignatureCountMismatch {
                declared,
                available,
            });
        }
        if declared > self.guardian_set_size {
            return Err(DecodeError::TooManySignatures {
                declared,
                set_size: self.guardian_set_size,
            });
        }

        let mut signatures = Vec::with_capacity(declared);
        for position in 0..declared {
            let guardian_index = reader.u8(Field::Signature)?;
            if guardian_index as usize >= self.guardian_set_size {
                return Err(DecodeError::GuardianIndexOutOfRange {
                    position,
                    index: guardian_index,
                    set_size: self.guardian_set_size,
                });
            }
            let signature = reader.array::<SIGNATURE_LEN>(Field::Signature)?;
            signatures.push(GuardianSignature {
                guardian_index,
                signature,
            });
        }

        let timestamp = reader.u32(Field::Timestamp)?;
        let nonce = reader.u32(Field::Nonce)?;
        let emitter_chain = reader.u16(Field::EmitterChain)?;
        let emitter_address = EmitterAddress::new(reader.array::<32>(Field::EmitterAddress)?);
        let sequence = reader.u64(Field::Sequence)?;
        let consistency_level = reader.u8(Field::ConsistencyLevel)?;
        let payload = reader.rest().to_vec();

        Ok(Attestation {
            version,
            guardian_set_index,
            signatures,
            timestamp,
            nonce,
            emitter_chain,
            emitter_address,
            sequence,
            consistency_level,
            payload,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, field: Field, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.bytes.len(),
            });
        }
        let bytes: &'a [u8] = self.bytes;
        let (head, tail) = bytes.split_at(needed);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, field: Field) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    fn u8(&mut self, field: Field) -> Result<u8, DecodeError> {
        Ok(self.array::<1>(field)?[0])
    }

    fn u16(&mut self, field: Field) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    fn u32(&mut self, field: Field) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    fn u64(&mut self, field: Field) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }

    fn rest(self) -> &'a [u8] {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(signatures: usize) -> Attestation {
        Attestation {
            version: VAA_VERSION,
            guardian_set_index: 0,
            signatures: (0..signatures)
                .map(|i| GuardianSignature {
                    guardian_index: i as u8,
                    signature: [i as u8 + 1; SIGNATURE_LEN],
                })
                .collect(),
            timestamp: 1_699_276_800,
            nonce: 42,
            emitter_chain: ChainId::Ethereum.to_u16(),
            emitter_address: EmitterAddress::from_evm(&[0x74; 20]),
            sequence: 0,
            consistency_level: 1,
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_decode_encoded_vaa() {
        let vaa = sample(2);
        let decoded = decode(&vaa.encode()).unwrap();
        assert_eq!(decoded, vaa);
        assert_eq!(decoded.payload_text(), "hello");
        assert_eq!(decoded.sequence, 0);
        assert_eq!(decoded.emitter_chain_id(), Some(ChainId::Ethereum));
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut vaa = sample(1);
        vaa.payload.clear();
        let decoded = decode(&vaa.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_declared_count_exceeds_bytes() {
        // 声明 5 个签名，实际只有 2 个签名的字节
        let vaa = sample(2);
        let mut bytes = vaa.encode();
        bytes.truncate(6 + 2 * SIGNATURE_ENTRY_LEN);
        bytes[5] = 5;
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::SignatureCountMismatch {
                declared: 5,
                available: 2
            })
        );
    }

    #[test]
    fn test_truncated_inputs_are_rejected() {
        let bytes = sample(1).encode();
        assert!(matches!(
            decode(&[]),
            Err(DecodeError::Truncated { field: Field::Version, .. })
        ));
        assert!(matches!(
            decode(&bytes[..3]),
            Err(DecodeError::Truncated { field: Field::GuardianSetIndex, .. })
        ));
        // 签名完整但消息体被截断
        let cut = 6 + SIGNATURE_ENTRY_LEN + 20;
        assert!(matches!(
            decode(&bytes[..cut]),
            Err(DecodeError::Truncated { field: Field::EmitterAddress, .. })
        ));
        for len in 0..(6 + SIGNATURE_ENTRY_LEN + BODY_FIXED_LEN) {
            assert!(decode(&bytes[..len]).is_err(), "length {} decoded", len);
        }
    }

    #[test]
    fn test_guardian_index_out_of_range() {
        let mut vaa = sample(2);
        vaa.signatures[1].guardian_index = 3;
        let bytes = vaa.encode();
        assert_eq!(
            Decoder::new(3).decode(&bytes),
            Err(DecodeError::GuardianIndexOutOfRange {
                position: 1,
                index: 3,
                set_size: 3
            })
        );
        assert!(Decoder::new(4).decode(&bytes).is_ok());
    }

    #[test]
    fn test_more_signatures_than_guardians() {
        let bytes = sample(3).encode();
        assert_eq!(
            Decoder::new(2).decode(&bytes),
            Err(DecodeError::TooManySignatures {
                declared: 3,
                set_size: 2
            })
        );
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample(0).encode();
        bytes[0] = 2;
        assert_eq!(decode(&bytes), Err(DecodeError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_digest_is_double_keccak_of_body() {
        let vaa = sample(0);
        assert_eq!(vaa.hash(), keccak256(&vaa.body()));
        assert_eq!(vaa.digest(), keccak256(&keccak256(&vaa.body())));
        assert_eq!(vaa.body().len(), BODY_FIXED_LEN + 5);
    }
}
