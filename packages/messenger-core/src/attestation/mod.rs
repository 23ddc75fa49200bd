use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

use crate::{config::AttestationConfig, types::MessageId, vaa, Error};

/// 按消息标识取回已签名的证明
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttestationSource: Send + Sync {
    async fn fetch(&self, id: &MessageId) -> Result<Vec<u8>, Error>;
}

/// 指数退避：首轮之后每轮等待时间翻倍，不超过上限
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 轮询轮数上限，每轮依次询问所有节点
    pub max_attempts: u32,
    pub deadline: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 轮（从 1 开始）结束后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            max_attempts: 20,
            deadline: Duration::from_secs(120),
        }
    }
}

impl From<&AttestationConfig> for RetryPolicy {
    fn from(config: &AttestationConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            deadline: Duration::from_secs(config.deadline_secs),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: String,
}

/// 单次请求的结果
enum Poll {
    Found(Vec<u8>),
    Pending,
    Unreachable(String),
}

/// 守护者 REST 客户端，按配置顺序轮询各节点
pub struct AttestationClient {
    hosts: Vec<String>,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl AttestationClient {
    pub fn new(
        hosts: Vec<String>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        if hosts.is_empty() {
            return Err(Error::Config("At least one attestation host is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            policy,
            client,
        })
    }

    pub fn from_config(config: &AttestationConfig) -> Result<Self, Error> {
        Self::new(
            config.hosts.clone(),
            RetryPolicy::from(config),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    async fn poll_host(&self, host: &str, id: &MessageId) -> Poll {
        let url = format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            host,
            id.chain.to_u16(),
            id.emitter.to_hex(),
            id.sequence
        );

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return Poll::Unreachable(e.to_string()),
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Poll::Pending;
        }
        if status.is_server_error() {
            return Poll::Unreachable(format!("{} returned {}", host, status));
        }
        if !status.is_success() {
            warn!("{} returned {} for {}", host, status, id);
            return Poll::Pending;
        }

        let body: SignedVaaResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Malformed attestation response from {}: {}", host, e);
                return Poll::Pending;
            }
        };
        let bytes = match STANDARD.decode(body.vaa_bytes.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Invalid base64 attestation from {}: {}", host, e);
                return Poll::Pending;
            }
        };
        // 结构不完整的 VAA 不算找到，继续询问下一个节点
        match vaa::decode(&bytes) {
            Ok(_) => Poll::Found(bytes),
            Err(e) => {
                warn!("Undecodable attestation from {} for {}: {}", host, id, e);
                Poll::Pending
            }
        }
    }
}

#[async_trait]
impl AttestationSource for AttestationClient {
    async fn fetch(&self, id: &MessageId) -> Result<Vec<u8>, Error> {
        let started = Instant::now();
        let mut reached_any = false;
        let mut last_error = String::new();
        let mut attempts = 0;

        info!("Waiting for attestation of {}", id);
        while attempts < self.policy.max_attempts {
            attempts += 1;

            for host in &self.hosts {
                let remaining = self.policy.deadline.saturating_sub(started.elapsed());
                let poll = match timeout(remaining, self.poll_host(host, id)).await {
                    Ok(poll) => poll,
                    Err(_) => {
                        warn!("Deadline reached while polling {} for {}", host, id);
                        last_error = format!("deadline reached while polling {}", host);
                        break;
                    }
                };
                match poll {
                    Poll::Found(bytes) => {
                        info!(
                            "Attestation for {} found on {} after {} attempt(s)",
                            id, host, attempts
                        );
                        return Ok(bytes);
                    }
                    Poll::Pending => {
                        reached_any = true;
                        debug!("Attestation for {} not yet on {}", id, host);
                    }
                    Poll::Unreachable(e) => {
                        warn!("Attestation host {} unreachable: {}", host, e);
                        last_error = e;
                    }
                }
            }

            let elapsed = started.elapsed();
            if attempts >= self.policy.max_attempts || elapsed >= self.policy.deadline {
                break;
            }
            let remaining = self.policy.deadline - elapsed;
            let delay = self.policy.delay_for(attempts).min(remaining);
            debug!("Retrying attestation for {} in {:?}", id, delay);
            sleep(delay).await;
        }

        let elapsed = started.elapsed();
        if reached_any {
            warn!("Gave up on attestation for {} after {} attempts", id, attempts);
            Err(Error::Timeout { attempts, elapsed })
        } else {
            Err(Error::AllEndpointsUnreachable { attempts, last_error })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, EmitterAddress};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts,
            deadline: Duration::from_secs(5),
        }
    }

    fn message_id() -> MessageId {
        MessageId::new(ChainId::Ethereum, EmitterAddress::from_evm(&[0xab; 20]), 0)
    }

    fn vaa_path(id: &MessageId) -> String {
        format!("/v1/signed_vaa/2/{}/0", id.emitter.to_hex())
    }

    fn signed_vaa(id: &MessageId, payload: &[u8]) -> Vec<u8> {
        vaa::Attestation {
            version: 1,
            guardian_set_index: 0,
            signatures: vec![],
            timestamp: 1_700_000_000,
            nonce: 42,
            emitter_chain: id.chain.to_u16(),
            emitter_address: id.emitter,
            sequence: id.sequence,
            consistency_level: 1,
            payload: payload.to_vec(),
        }
        .encode()
    }

    fn vaa_body(bytes: &[u8]) -> String {
        format!(r#"{{"vaaBytes":"{}"}}"#, STANDARD.encode(bytes))
    }

    fn client(hosts: Vec<String>, policy: RetryPolicy) -> AttestationClient {
        AttestationClient::new(hosts, policy, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
        assert_eq!(policy.delay_for(64), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_fetch_found_and_stable() {
        let mut server = mockito::Server::new_async().await;
        let id = message_id();
        let signed = signed_vaa(&id, b"signed");
        let mock = server
            .mock("GET", vaa_path(&id).as_str())
            .with_status(200)
            .with_body(vaa_body(&signed))
            .expect(2)
            .create_async()
            .await;

        let client = client(vec![server.url()], fast_policy(3));
        let first = client.fetch(&id).await.unwrap();
        let second = client.fetch(&id).await.unwrap();
        assert_eq!(first, signed);
        assert_eq!(first, second);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_falls_back_to_next_host() {
        let mut missing = mockito::Server::new_async().await;
        let mut serving = mockito::Server::new_async().await;
        let id = message_id();
        missing
            .mock("GET", vaa_path(&id).as_str())
            .with_status(404)
            .create_async()
            .await;
        let signed = signed_vaa(&id, b"vaa");
        serving
            .mock("GET", vaa_path(&id).as_str())
            .with_body(vaa_body(&signed))
            .create_async()
            .await;

        let client = client(vec![missing.url(), format!("{}/", serving.url())], fast_policy(1));
        assert_eq!(client.fetch(&id).await.unwrap(), signed);
    }

    #[tokio::test]
    async fn test_undecodable_vaa_falls_through_to_next_host() {
        let mut garbage = mockito::Server::new_async().await;
        let mut serving = mockito::Server::new_async().await;
        let id = message_id();
        let garbage_mock = garbage
            .mock("GET", vaa_path(&id).as_str())
            .with_body(vaa_body(b"not a vaa"))
            .expect(1)
            .create_async()
            .await;
        let signed = signed_vaa(&id, b"hello");
        serving
            .mock("GET", vaa_path(&id).as_str())
            .with_body(vaa_body(&signed))
            .create_async()
            .await;

        let client = client(vec![garbage.url(), serving.url()], fast_policy(1));
        assert_eq!(client.fetch(&id).await.unwrap(), signed);
        garbage_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slow_host_cannot_overrun_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // 接受连接但从不应答
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            max_attempts: 5,
            deadline: Duration::from_millis(200),
        };
        let hosts = vec![format!("http://{}", addr)];
        let client = AttestationClient::new(hosts, policy, Duration::from_secs(30)).unwrap();

        let started = Instant::now();
        let result = client.fetch(&message_id()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(Error::AllEndpointsUnreachable { .. })));
        hold.abort();
    }

    #[tokio::test]
    async fn test_times_out_when_never_signed() {
        let mut server = mockito::Server::new_async().await;
        let id = message_id();
        let mock = server
            .mock("GET", vaa_path(&id).as_str())
            .with_status(404)
            .expect(3)
            .create_async()
            .await;

        let client = client(vec![server.url()], fast_policy(3));
        match client.fetch(&id).await {
            Err(Error::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deadline_bounds_the_wait() {
        let mut server = mockito::Server::new_async().await;
        let id = message_id();
        server
            .mock("GET", vaa_path(&id).as_str())
            .with_status(404)
            .create_async()
            .await;

        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_attempts: u32::MAX,
            deadline: Duration::from_millis(300),
        };
        let started = Instant::now();
        let result = client(vec![server.url()], policy).fetch(&id).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_malformed_response_counts_as_pending() {
        let mut server = mockito::Server::new_async().await;
        let id = message_id();
        server
            .mock("GET", vaa_path(&id).as_str())
            .with_body("not json")
            .create_async()
            .await;

        let result = client(vec![server.url()], fast_policy(2)).fetch(&id).await;
        assert!(matches!(result, Err(Error::Timeout { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn test_all_endpoints_unreachable() {
        let mut server = mockito::Server::new_async().await;
        let id = message_id();
        server
            .mock("GET", vaa_path(&id).as_str())
            .with_status(503)
            .create_async()
            .await;

        let hosts = vec!["http://127.0.0.1:1".to_string(), server.url()];
        match client(hosts, fast_policy(2)).fetch(&id).await {
            Err(Error::AllEndpointsUnreachable { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_requires_a_host() {
        assert!(matches!(
            AttestationClient::new(vec![], RetryPolicy::default(), Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }
}
