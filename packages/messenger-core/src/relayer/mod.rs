use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    attestation::{AttestationClient, AttestationSource},
    chain_adapter::{AdapterRegistry, DefaultChainAdapterFactory},
    config::Config,
    types::{ChainId, MessageId, Nonce, Stage, SubmittedMessage},
    vaa::{Attestation, Decoder},
    verify::{GuardianSet, SignatureVerifier},
    wallet::Wallets,
    Error,
};

const EVENT_CAPACITY: usize = 64;

/// 单条消息中继的状态机
#[derive(Debug, Clone)]
pub enum RelayState {
    Idle,
    Submitting { chain: ChainId },
    AwaitingAttestation(SubmittedMessage),
    Decoding(SubmittedMessage),
    Delivered(Attestation),
    Failed(RelayFailure),
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Delivered(_) | RelayState::Failed(_))
    }

    /// 当前所处（或失败时所在）的阶段
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RelayState::Idle | RelayState::Delivered(_) => None,
            RelayState::Submitting { .. } => Some(Stage::Submitting),
            RelayState::AwaitingAttestation(_) => Some(Stage::AwaitingAttestation),
            RelayState::Decoding(_) => Some(Stage::Decoding),
            RelayState::Failed(failure) => Some(failure.stage),
        }
    }
}

/// 带阶段标记的中继失败
#[derive(Debug, Clone, thiserror::Error)]
#[error("Relay failed while {stage}: {error}")]
pub struct RelayFailure {
    pub stage: Stage,
    /// 已广播的交易标识，确认前失败时也会保留
    pub transaction: Option<String>,
    /// 交易已确认且解析出序列号时为 `Some`
    pub message: Option<SubmittedMessage>,
    #[source]
    pub error: Error,
}

impl RelayFailure {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self {
            stage,
            transaction: None,
            message: None,
            error,
        }
    }

    pub fn broadcast(mut self, transaction: &str) -> Self {
        self.transaction = Some(transaction.to_string());
        self
    }

    pub fn with_message(mut self, message: SubmittedMessage) -> Self {
        self.transaction = Some(message.transaction.clone());
        self.message = Some(message);
        self
    }

    /// 交易是否已经广播（费用已花出，不可撤销）
    pub fn submitted(&self) -> bool {
        self.transaction.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Delivered {
        id: MessageId,
        attestation: Attestation,
    },
    Failed(RelayFailure),
}

/// 已送达证明的共享列表，最新的在前
#[derive(Clone, Default)]
pub struct MessageLog {
    entries: Arc<RwLock<Vec<Attestation>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, attestation: Attestation) {
        self.entries.write().await.insert(0, attestation);
    }

    pub async fn snapshot(&self) -> Vec<Attestation> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// 后台中继任务的句柄
pub struct RelayHandle {
    state: watch::Receiver<RelayState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<Attestation, RelayFailure>>,
}

impl RelayHandle {
    pub fn state(&self) -> RelayState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    /// 停止后续轮询，已提交的交易不会回滚
    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<Attestation, RelayFailure> {
        let stage = self.state.borrow().stage().unwrap_or(Stage::Submitting);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RelayFailure::new(
                stage,
                Error::Chain(format!("Relay task aborted: {}", e)),
            )),
        }
    }
}

pub struct Relayer {
    adapters: AdapterRegistry,
    source: Arc<dyn AttestationSource>,
    decoder: Decoder,
    verifier: Option<SignatureVerifier>,
    log: MessageLog,
    events: broadcast::Sender<RelayEvent>,
}

impl Relayer {
    pub fn new(config: &Config, wallets: Wallets) -> Result<Self, Error> {
        let factory = DefaultChainAdapterFactory::new(wallets);
        let adapters = AdapterRegistry::from_configs(&factory, &config.chains)?;
        let source = Arc::new(AttestationClient::from_config(&config.attestation)?);

        let mut relayer = Self::with_parts(adapters, source);
        if let Some(guardian_set) = &config.guardian_set {
            let set = GuardianSet::from_config(guardian_set)?;
            info!(
                "Verifying attestations against guardian set {} ({} keys)",
                set.index,
                set.len()
            );
            relayer = relayer.with_verifier(SignatureVerifier::new(set));
        }
        Ok(relayer)
    }

    pub fn with_parts(adapters: AdapterRegistry, source: Arc<dyn AttestationSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            adapters,
            source,
            decoder: Decoder::default(),
            verifier: None,
            log: MessageLog::new(),
            events,
        }
    }

    /// 启用签名验证，解码时按该集合的规模检查守护者下标
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.decoder = Decoder::new(verifier.guardian_set().len());
        self.verifier = Some(verifier);
        self
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self) -> MessageLog {
        self.log.clone()
    }

    pub async fn relay(
        &self,
        chain: ChainId,
        payload: &[u8],
        nonce: Nonce,
    ) -> Result<Attestation, RelayFailure> {
        let (state, _) = watch::channel(RelayState::Idle);
        self.relay_with(chain, payload, nonce, &CancellationToken::new(), &state)
            .await
    }

    /// 在后台任务中中继一条消息
    pub fn spawn(self: &Arc<Self>, chain: ChainId, payload: Vec<u8>, nonce: Nonce) -> RelayHandle {
        let (state_tx, state_rx) = watch::channel(RelayState::Idle);
        let cancel = CancellationToken::new();
        let relayer = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            relayer
                .relay_with(chain, &payload, nonce, &token, &state_tx)
                .await
        });
        RelayHandle {
            state: state_rx,
            cancel,
            task,
        }
    }

    pub async fn relay_with(
        &self,
        chain: ChainId,
        payload: &[u8],
        nonce: Nonce,
        cancel: &CancellationToken,
        state: &watch::Sender<RelayState>,
    ) -> Result<Attestation, RelayFailure> {
        state.send_replace(RelayState::Submitting { chain });
        let adapter = self
            .adapters
            .get(chain)
            .map_err(|e| self.fail(RelayFailure::new(Stage::Submitting, e), state))?;

        info!("Submitting {} byte message to {} (nonce {})", payload.len(), chain, nonce);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = adapter.send(payload, nonce) => result,
        };
        let transaction =
            result.map_err(|e| self.fail(RelayFailure::new(Stage::Submitting, e), state))?;

        // 交易已广播，之后的失败都要带上交易标识
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = adapter.confirm(&transaction) => result,
        };
        let submitted = result.map_err(|e| {
            let failure = RelayFailure::new(Stage::Submitting, e);
            self.fail(failure.broadcast(&transaction), state)
        })?;

        state.send_replace(RelayState::AwaitingAttestation(submitted.clone()));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.source.fetch(&submitted.id) => result,
        };
        let bytes = result.map_err(|e| {
            let failure = RelayFailure::new(Stage::AwaitingAttestation, e);
            self.fail(failure.with_message(submitted.clone()), state)
        })?;

        state.send_replace(RelayState::Decoding(submitted.clone()));
        let attestation = self.decode(&submitted.id, &bytes).map_err(|e| {
            let failure = RelayFailure::new(Stage::Decoding, e);
            self.fail(failure.with_message(submitted.clone()), state)
        })?;

        info!("Delivered {} ({} byte payload)", submitted.id, attestation.payload.len());
        self.log.push(attestation.clone()).await;
        state.send_replace(RelayState::Delivered(attestation.clone()));
        // 没有订阅者时发送失败，可以忽略
        let _ = self.events.send(RelayEvent::Delivered {
            id: submitted.id,
            attestation: attestation.clone(),
        });
        Ok(attestation)
    }

    fn decode(&self, id: &MessageId, bytes: &[u8]) -> Result<Attestation, Error> {
        let attestation = self.decoder.decode(bytes)?;

        if attestation.message_id().as_ref() != Some(id) {
            return Err(Error::Verification(format!(
                "Attestation is for chain {} sequence {}, expected {}",
                attestation.emitter_chain, attestation.sequence, id
            )));
        }
        if let Some(verifier) = &self.verifier {
            let valid = verifier.verify(&attestation)?;
            debug!("{} carries {} valid guardian signatures", id, valid);
        }
        Ok(attestation)
    }

    fn fail(&self, failure: RelayFailure, state: &watch::Sender<RelayState>) -> RelayFailure {
        error!("{}", failure);
        state.send_replace(RelayState::Failed(failure.clone()));
        let _ = self.events.send(RelayEvent::Failed(failure.clone()));
        failure
    }
}
