use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{Error, UNKNOWN_ERROR};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// 单个链节点的 JSON-RPC 客户端
pub struct JsonRpcClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 发起调用；`null` 结果按 `T` 的反序列化规则处理（例如 `Option<T>` 得到 `None`）
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id,
            }))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Chain(format!("Invalid {} response: {}", method, e)))?;

        if let Some(error) = body.error {
            let message = if error.message.is_empty() {
                UNKNOWN_ERROR.to_string()
            } else {
                error.message
            };
            return Err(Error::Rpc {
                code: error.code,
                message,
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| Error::Serialization(format!("Unexpected {} result: {}", method, e)))
    }
}

/// 解析 0x 开头的十六进制数量
pub fn parse_quantity(value: &str) -> Result<u64, Error> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Serialization(format!("Invalid quantity {}: {}", value, e)))
}
