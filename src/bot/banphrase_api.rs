// src/bot/banphrase_api.rs - External banphrase API clients

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::types::PipelineError;

/// Supported external API flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKind {
    Pajbot,
}

impl FromStr for ApiKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pajbot" => Ok(ApiKind::Pajbot),
            _ => Err(PipelineError::UnknownApiKind(s.to_string())),
        }
    }
}

/// Details the API returns about the phrase that matched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BanphraseData {
    #[serde(default)]
    pub phrase: Option<String>,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiVerdict {
    Clean,
    Banned(BanphraseData),
}

/// Why the API could not give a verdict
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiFailure {
    #[error("request timed out")]
    Timeout,
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("{0}")]
    Unknown(String),
}

#[async_trait]
pub trait BanphraseApi: Send + Sync {
    /// Ask the API at `url` whether `message` is allowed
    async fn test(&self, url: &str, message: &str) -> Result<ApiVerdict, ApiFailure>;
}

#[derive(Debug, Deserialize)]
struct PajbotResponse {
    banned: bool,
    #[serde(default)]
    banphrase_data: Option<BanphraseData>,
}

/// Client for Pajbot-compatible `/api/v1/banphrases/test` endpoints
pub struct PajbotClient {
    http: reqwest::Client,
}

impl PajbotClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chatpipe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    fn endpoint(url: &str) -> String {
        format!("{}/api/v1/banphrases/test", url.trim_end_matches('/'))
    }

    fn classify(error: &reqwest::Error) -> ApiFailure {
        if error.is_timeout() {
            ApiFailure::Timeout
        } else if let Some(status) = error.status() {
            ApiFailure::Status(status.as_u16())
        } else {
            ApiFailure::Unknown(error.to_string())
        }
    }

    async fn attempt(&self, endpoint: &str, message: &str) -> Result<ApiVerdict, reqwest::Error> {
        let response = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await?
            .error_for_status()?;

        let body: PajbotResponse = response.json().await?;
        Ok(if body.banned {
            ApiVerdict::Banned(body.banphrase_data.unwrap_or_default())
        } else {
            ApiVerdict::Clean
        })
    }
}

#[async_trait]
impl BanphraseApi for PajbotClient {
    async fn test(&self, url: &str, message: &str) -> Result<ApiVerdict, ApiFailure> {
        let endpoint = Self::endpoint(url);

        match self.attempt(&endpoint, message).await {
            Ok(verdict) => Ok(verdict),
            // A single retry, and only for transport-level trouble
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!("Banphrase API {} failed ({}), retrying once", endpoint, e);
                self.attempt(&endpoint, message).await.map_err(|e| Self::classify(&e))
            }
            Err(e) => {
                debug!("Banphrase API {} failed: {}", endpoint, e);
                Err(Self::classify(&e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_api_kind_parsing() {
        assert_eq!("pajbot".parse::<ApiKind>().unwrap(), ApiKind::Pajbot);
        assert_eq!("Pajbot".parse::<ApiKind>().unwrap(), ApiKind::Pajbot);
        assert!(matches!(
            "nightbot".parse::<ApiKind>(),
            Err(PipelineError::UnknownApiKind(kind)) if kind == "nightbot"
        ));
    }

    #[tokio::test]
    async fn test_clean_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/banphrases/test")
            .match_body(mockito::Matcher::Json(serde_json::json!({ "message": "hello" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"banned": false, "input_message": "hello"}"#)
            .create_async()
            .await;

        let client = PajbotClient::new(Duration::from_secs(5)).unwrap();
        let verdict = client.test(&format!("{}/", server.url()), "hello").await.unwrap();
        assert_eq!(verdict, ApiVerdict::Clean);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_banned_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/banphrases/test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "banned": true,
                    "banphrase_data": {"phrase": "spam", "id": 12, "length": 600, "permanent": false}
                }"#,
            )
            .create_async()
            .await;

        let client = PajbotClient::new(Duration::from_secs(5)).unwrap();
        match client.test(&server.url(), "buy spam").await.unwrap() {
            ApiVerdict::Banned(data) => {
                assert_eq!(data.phrase.as_deref(), Some("spam"));
                assert_eq!(data.id, Some(12));
                assert_eq!(data.extra.get("permanent"), Some(&serde_json::json!(false)));
            }
            other => panic!("expected a ban, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_status_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = PajbotClient::new(Duration::from_secs(5)).unwrap();
        let failure = client.test(&server.url(), "anything").await.unwrap_err();
        assert_eq!(failure, ApiFailure::Status(503));
    }

    /// A mock whose first `slow_calls` responses stall well past the client timeout
    async fn stalling_mock(server: &mut mockito::ServerGuard, slow_calls: usize, hits: usize) -> mockito::Mock {
        let calls = Arc::new(AtomicUsize::new(0));
        server
            .mock("POST", "/api/v1/banphrases/test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_chunked_body(move |writer| {
                if calls.fetch_add(1, Ordering::SeqCst) < slow_calls {
                    std::thread::sleep(Duration::from_millis(1000));
                }
                writer.write_all(br#"{"banned": false}"#)
            })
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_timeout_is_retried_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = stalling_mock(&mut server, usize::MAX, 2).await;

        let client = PajbotClient::new(Duration::from_millis(200)).unwrap();
        let failure = client.test(&server.url(), "anything").await.unwrap_err();
        assert_eq!(failure, ApiFailure::Timeout);

        // let the stalled responses finish before counting hits
        tokio::time::sleep(Duration::from_millis(1200)).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retry_after_timeout_can_succeed() {
        let mut server = mockito::Server::new_async().await;
        let mock = stalling_mock(&mut server, 1, 2).await;

        let client = PajbotClient::new(Duration::from_millis(200)).unwrap();
        let verdict = client.test(&server.url(), "anything").await.unwrap();
        assert_eq!(verdict, ApiVerdict::Clean);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_garbage_body_is_unknown_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", mockito::Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = PajbotClient::new(Duration::from_secs(5)).unwrap();
        let failure = client.test(&server.url(), "anything").await.unwrap_err();
        assert!(matches!(failure, ApiFailure::Unknown(_)));
    }
}
