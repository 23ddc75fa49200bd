use log::{debug, info, warn};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, Secp256k1, VerifyOnly,
};

use crate::{
    config::GuardianSetConfig,
    vaa::{keccak256, Attestation, SIGNATURE_LEN},
    Error,
};

/// 守护者集合：下标即守护者编号，值为其以太坊风格的 20 字节地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSet {
    pub index: u32,
    pub keys: Vec<[u8; 20]>,
}

impl GuardianSet {
    pub fn new(index: u32, keys: Vec<[u8; 20]>) -> Self {
        Self { index, keys }
    }

    pub fn from_config(config: &GuardianSetConfig) -> Result<Self, Error> {
        let keys = config
            .keys
            .iter()
            .map(|key| crate::types::parse_evm_address(key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(config.index, keys))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 超过三分之二的签名数
    pub fn quorum(&self) -> usize {
        quorum(self.keys.len())
    }
}

pub fn quorum(guardians: usize) -> usize {
    guardians * 2 / 3 + 1
}

/// 从公钥推导守护者地址：keccak256(未压缩公钥去掉前缀)的后 20 字节
pub fn guardian_address(public_key: &PublicKey) -> [u8; 20] {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// 守护者签名验证器
pub struct SignatureVerifier {
    guardian_set: GuardianSet,
    secp: Secp256k1<VerifyOnly>,
}

impl SignatureVerifier {
    pub fn new(guardian_set: GuardianSet) -> Self {
        info!(
            "Creating signature verifier for guardian set {} ({} guardians)",
            guardian_set.index,
            guardian_set.len()
        );
        Self {
            guardian_set,
            secp: Secp256k1::verification_only(),
        }
    }

    pub fn guardian_set(&self) -> &GuardianSet {
        &self.guardian_set
    }

    /// 从签名恢复出签名者地址，兼容 0/1 与 27/28 两种恢复位
    pub fn recover(
        &self,
        digest: [u8; 32],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<[u8; 20], Error> {
        let v = signature[64];
        let v = if v >= 27 { v - 27 } else { v };
        let recovery_id = RecoveryId::from_i32(v as i32)
            .map_err(|e| Error::Verification(format!("Invalid recovery id {}: {}", v, e)))?;
        let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
            .map_err(|e| Error::Verification(format!("Invalid signature: {}", e)))?;
        let public_key = self
            .secp
            .recover_ecdsa(&Message::from_digest(digest), &recoverable)
            .map_err(|e| Error::Verification(format!("Failed to recover signer: {}", e)))?;
        Ok(guardian_address(&public_key))
    }

    /// 验证所有签名并检查法定人数，返回有效签名数
    pub fn verify(&self, vaa: &Attestation) -> Result<usize, Error> {
        debug!(
            "Verifying VAA chain={} sequence={} with {} signatures",
            vaa.emitter_chain,
            vaa.sequence,
            vaa.signatures.len()
        );

        if vaa.guardian_set_index != self.guardian_set.index {
            return Err(Error::Verification(format!(
                "VAA signed by guardian set {}, expected {}",
                vaa.guardian_set_index, self.guardian_set.index
            )));
        }

        let required = self.guardian_set.quorum();
        if vaa.signatures.len() < required {
            warn!("VAA has {} signatures, quorum is {}", vaa.signatures.len(), required);
            return Err(Error::Verification(format!(
                "Not enough signatures: {} of {} required",
                vaa.signatures.len(),
                required
            )));
        }

        let digest = vaa.digest();
        let mut last_index: Option<u8> = None;
        for sig in &vaa.signatures {
            if last_index.is_some_and(|last| sig.guardian_index <= last) {
                return Err(Error::Verification(
                    "Guardian indices must be strictly ascending".to_string(),
                ));
            }
            last_index = Some(sig.guardian_index);

            let expected = self
                .guardian_set
                .keys
                .get(sig.guardian_index as usize)
                .ok_or_else(|| {
                    Error::Verification(format!("Unknown guardian index {}", sig.guardian_index))
                })?;
            let recovered = self.recover(digest, &sig.signature)?;
            if &recovered != expected {
                warn!("Signature of guardian {} does not match its key", sig.guardian_index);
                return Err(Error::Verification(format!(
                    "Signature of guardian {} does not match",
                    sig.guardian_index
                )));
            }
        }

        info!(
            "VAA verified: {}/{} guardians signed",
            vaa.signatures.len(),
            self.guardian_set.len()
        );
        Ok(vaa.signatures.len())
    }
}
