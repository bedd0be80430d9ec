//! Push gateway client.
//!
//! The gateway relays provider-agnostic content to FCM/APNs/web push. A
//! device-level rejection is reported as a failed [`DeliveryOutcome`];
//! only a failure of the gateway itself is a [`GatewayError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::PushConfig;

use super::types::{DeliveryOutcome, PushContent};

const RESPONSE_MISMATCH: &str = "gateway response mismatch";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gateway returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::InvalidResponse(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Sends rendered content to devices
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(
        &self,
        device_token: &str,
        content: &PushContent,
    ) -> Result<DeliveryOutcome, GatewayError>;

    /// One outcome per token, in token order.
    async fn send_many(
        &self,
        device_tokens: &[String],
        content: &PushContent,
    ) -> Result<Vec<DeliveryOutcome>, GatewayError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    token: &'a str,
    notification: &'a PushContent,
}

#[derive(Serialize)]
struct SendManyRequest<'a> {
    tokens: &'a [String],
    notification: &'a PushContent,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendManyResponse {
    #[serde(default)]
    responses: Option<Vec<SendResponse>>,
}

impl SendResponse {
    fn into_outcome(self, token: &str) -> DeliveryOutcome {
        if self.success {
            DeliveryOutcome::delivered(token, self.message_id.unwrap_or_default())
        } else {
            DeliveryOutcome::failed(
                token,
                self.error.unwrap_or_else(|| "rejected by provider".to_string()),
            )
        }
    }
}

/// HTTP client for the push relay
pub struct HttpPushGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPushGateway {
    pub fn new(config: &PushConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Reason text for a request the gateway refused with a 4xx status
async fn rejection_reason(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        format!("rejected with status {}", status.as_u16())
    } else {
        body
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(
        &self,
        device_token: &str,
        content: &PushContent,
    ) -> Result<DeliveryOutcome, GatewayError> {
        let token = device_token.trim();
        let response = self
            .post(
                "/v1/send",
                &SendRequest {
                    token,
                    notification: content,
                },
            )
            .await?;

        if response.status().is_client_error() {
            let reason = rejection_reason(response).await;
            tracing::warn!(device_token = %token, error = %reason, "Push rejected for device");
            return Ok(DeliveryOutcome::failed(token, reason));
        }

        let reply: SendResponse = response.json().await?;
        let outcome = reply.into_outcome(token);
        if outcome.success {
            tracing::debug!(device_token = %token, message_id = ?outcome.message_id, "Push sent");
        } else {
            tracing::warn!(device_token = %token, error = ?outcome.error, "Push rejected for device");
        }
        Ok(outcome)
    }

    async fn send_many(
        &self,
        device_tokens: &[String],
        content: &PushContent,
    ) -> Result<Vec<DeliveryOutcome>, GatewayError> {
        let tokens: Vec<String> = device_tokens.iter().map(|t| t.trim().to_string()).collect();
        let response = self
            .post(
                "/v1/send-many",
                &SendManyRequest {
                    tokens: &tokens,
                    notification: content,
                },
            )
            .await?;

        if response.status().is_client_error() {
            let detail = rejection_reason(response).await;
            tracing::warn!(tokens_len = tokens.len(), error = %detail, "Push multicast rejected");
            return Ok(tokens
                .iter()
                .map(|t| DeliveryOutcome::failed(t.as_str(), detail.clone()))
                .collect());
        }

        let reply: SendManyResponse = response.json().await?;
        let outcomes = match reply.responses {
            Some(responses) if responses.len() == tokens.len() => responses
                .into_iter()
                .zip(tokens.iter())
                .map(|(r, t)| r.into_outcome(t))
                .collect::<Vec<_>>(),
            other => {
                tracing::error!(
                    responses_len = other.as_ref().map(|r| r.len()).unwrap_or(0),
                    tokens_len = tokens.len(),
                    "Push gateway multicast response mismatch"
                );
                tokens
                    .iter()
                    .map(|t| DeliveryOutcome::failed(t.as_str(), RESPONSE_MISMATCH))
                    .collect()
            }
        };

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(
            success_count = succeeded,
            failure_count = outcomes.len() - succeeded,
            "Push multicast sent"
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn gateway(url: String) -> HttpPushGateway {
        HttpPushGateway::new(&PushConfig {
            gateway_url: url,
            api_key: Some("secret".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn content() -> PushContent {
        PushContent {
            title: "Hello".into(),
            body: "World".into(),
            image_url: None,
            link: None,
            data: Default::default(),
            priority: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_send_single_success() {
        let url = serve(Router::new().route(
            "/v1/send",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["token"], "tok-1");
                assert_eq!(body["notification"]["title"], "Hello");
                Json(json!({"success": true, "message_id": "m-1"}))
            }),
        ))
        .await;

        let outcome = gateway(url).send(" tok-1 ", &content()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.device_token, "tok-1");
        assert_eq!(outcome.message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_client_error_is_device_failure() {
        let url = serve(Router::new().route(
            "/v1/send",
            post(|| async { (AxumStatus::BAD_REQUEST, "invalid registration token") }),
        ))
        .await;

        let outcome = gateway(url).send("bad", &content()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("invalid registration token"));
    }

    #[tokio::test]
    async fn test_server_error_is_gateway_error() {
        let url = serve(Router::new().route(
            "/v1/send",
            post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;

        let err = gateway(url).send("tok", &content()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Status {
                status: 503,
                body: "down".into()
            }
        );
    }

    #[tokio::test]
    async fn test_send_many_maps_in_order() {
        let url = serve(Router::new().route(
            "/v1/send-many",
            post(|| async {
                Json(json!({"responses": [
                    {"success": true, "message_id": "m-1"},
                    {"success": false, "error": "unregistered"},
                    {"success": true, "message_id": "m-3"}
                ]}))
            }),
        ))
        .await;

        let tokens = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let outcomes = gateway(url).send_many(&tokens, &content()).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[1].device_token, "b");
        assert_eq!(outcomes[1].error.as_deref(), Some("unregistered"));
        assert!(outcomes[2].success);
    }

    #[tokio::test]
    async fn test_send_many_length_mismatch_fails_every_device() {
        let url = serve(Router::new().route(
            "/v1/send-many",
            post(|| async { Json(json!({"responses": [{"success": true}]})) }),
        ))
        .await;

        let tokens = vec!["a".to_string(), "b".to_string()];
        let outcomes = gateway(url).send_many(&tokens, &content()).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
        assert_eq!(outcomes[0].error.as_deref(), Some(RESPONSE_MISMATCH));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transport_error() {
        let err = gateway("http://127.0.0.1:1".into())
            .send("tok", &content())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_) | GatewayError::Timeout));
    }
}
