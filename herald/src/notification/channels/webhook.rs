//! Generic webhook provider (JSON over HTTP POST).

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{DeliveryContext, NotificationResult};
use crate::notification::provider::ChannelProvider;
use crate::notification::retry::is_retryable_status;
use crate::{Error, Result};

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Webhook provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Target URL.
    pub url: String,
    /// Channel the provider registers for.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// URL fetched with GET by the health check. Without it the provider is
    /// always considered healthy.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Honour `HTTP_PROXY`-style environment variables.
    #[serde(default)]
    pub use_system_proxy: bool,
}

fn default_channel() -> String {
    "webhook".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel: default_channel(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
            health_url: None,
            use_system_proxy: false,
        }
    }
}

impl WebhookConfig {
    /// Every problem with this configuration.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            problems.push(format!("url must be an http(s) URL, got {:?}", self.url));
        }
        if let Some(health_url) = &self.health_url
            && !(health_url.starts_with("http://") || health_url.starts_with("https://"))
        {
            problems.push(format!("health_url must be an http(s) URL, got {:?}", health_url));
        }
        if self.channel.trim().is_empty() {
            problems.push("channel must not be empty".to_string());
        }
        if self.timeout_secs == 0 {
            problems.push("timeout_secs must be greater than 0".to_string());
        }
        for (name, value) in &self.headers {
            if name.parse::<reqwest::header::HeaderName>().is_err() {
                problems.push(format!("invalid header name {:?}", name));
            }
            if value.parse::<reqwest::header::HeaderValue>().is_err() {
                problems.push(format!("invalid value for header {:?}", name));
            }
        }

        problems
    }
}

/// Posts `{event_id, correlation_id, event_type, attempt, payload}` to a URL.
///
/// 2xx is `sent`. 408, 429 and 5xx as well as transport failures are returned
/// as errors. Any other status is reported as a `failed` result.
pub struct WebhookProvider {
    name: String,
    config: WebhookConfig,
    client: Client,
}

impl WebhookProvider {
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Result<Self> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(Error::config(format!(
                "invalid webhook configuration: {}",
                problems.join("; ")
            )));
        }

        install_rustls_provider();

        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    /// Build from the opaque JSON found under `providers.<name>`.
    pub fn from_value(name: impl Into<String>, config: &Value) -> Result<Self> {
        let config: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid webhook configuration: {}", e)))?;
        Self::new(name, config)
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {}", token).parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            // Applied on the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    fn build_body(&self, payload: &Value, context: &DeliveryContext) -> Value {
        json!({
            "event_id": context.event_id,
            "correlation_id": context.correlation_id,
            "event_type": context.event_type,
            "attempt": context.attempt,
            "payload": payload,
        })
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::delivery(format!("webhook request timed out: {}", e))
    } else if e.is_connect() {
        Error::delivery(format!("webhook connection refused: {}", e))
    } else {
        Error::delivery(format!("webhook request failed: {}", e))
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> &str {
        &self.config.channel
    }

    async fn send(&self, payload: &Value, context: &DeliveryContext) -> Result<NotificationResult> {
        let mut request = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&self.build_body(payload, context));

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            debug!(
                event_id = %context.event_id,
                status = status.as_u16(),
                "Webhook delivered"
            );
            return Ok(NotificationResult::sent(&self.config.channel, &self.name)
                .with_metadata("http_status", json!(status.as_u16())));
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            event_id = %context.event_id,
            status = status.as_u16(),
            attempt = context.attempt,
            "Webhook rejected delivery"
        );

        if is_retryable_status(status.as_u16()) {
            return Err(Error::delivery_status(status.as_u16(), body));
        }

        Ok(NotificationResult::failed(
            &self.config.channel,
            &self.name,
            format!("HTTP {}: {}", status.as_u16(), body),
        )
        .with_metadata("http_status", json!(status.as_u16())))
    }

    async fn health_check(&self) -> bool {
        let Some(url) = &self.config.health_url else {
            return true;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Webhook health check failed");
                false
            }
        }
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        let config: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| vec![format!("invalid webhook configuration: {}", e)])?;
        let problems = config.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryStatus, Event};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, answer with `status`, and hand back the raw request.
    async fn serve_once(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= pos + 4 + body_len {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {} Test\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&buf).to_string()
        });

        (format!("http://{}/hook", addr), handle)
    }

    fn provider(url: String) -> WebhookProvider {
        WebhookProvider::new(
            "hooks",
            WebhookConfig {
                url,
                auth: Some(WebhookAuth::Bearer {
                    token: "secret".to_string(),
                }),
                timeout_secs: 5,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn context() -> (Event, DeliveryContext) {
        let event = Event::new("order.paid", json!({"orderId": 7}), Some("corr-1".into()));
        let ctx = event.delivery_context(HashMap::new());
        (event, ctx)
    }

    #[test]
    fn test_config_problems() {
        let config = WebhookConfig {
            url: "ftp://example.com".to_string(),
            timeout_secs: 0,
            headers: vec![("bad header".to_string(), "v".to_string())],
            ..Default::default()
        };
        assert_eq!(config.problems().len(), 3);

        let config = WebhookConfig {
            url: "https://example.com/hook".to_string(),
            ..Default::default()
        };
        assert!(config.problems().is_empty());
        assert!(WebhookProvider::new("x", WebhookConfig::default()).is_err());
    }

    #[test]
    fn test_validate_config_reports_problems() {
        let provider = provider("https://example.com/hook".to_string());
        assert!(provider
            .validate_config(&json!({"url": "https://example.com/other"}))
            .is_ok());
        let problems = provider
            .validate_config(&json!({"url": "nope", "timeout_secs": 0}))
            .unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(provider.validate_config(&json!({"timeout_secs": 3})).is_err());
    }

    #[test]
    fn test_build_body_and_headers() {
        let provider = provider("https://example.com/hook".to_string());
        let (event, ctx) = context();

        let body = provider.build_body(&event.payload, &ctx.for_attempt(2));
        assert_eq!(body["event_id"], event.event_id.as_str());
        assert_eq!(body["correlation_id"], "corr-1");
        assert_eq!(body["attempt"], 2);
        assert_eq!(body["payload"]["orderId"], 7);

        assert!(provider.build_headers().contains_key(reqwest::header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_success_is_sent() {
        let (url, server) = serve_once(200).await;
        let provider = provider(url);
        let (event, ctx) = context();

        let result = provider.send(&event.payload, &ctx).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(result.channel, "webhook");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains(&event.event_id));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_client_error_is_failed_result() {
        let (url, server) = serve_once(404).await;
        let provider = provider(url);
        let (event, ctx) = context();

        let result = provider.send(&event.payload, &ctx).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert!(result.error.unwrap().starts_with("HTTP 404"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_error() {
        let (url, server) = serve_once(503).await;
        let provider = provider(url);
        let (event, ctx) = context();

        let err = provider.send(&event.payload, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Delivery { status: Some(503), .. }));
        assert!(crate::notification::retry::is_retryable(&err));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_without_health_url() {
        let provider = provider("https://example.com/hook".to_string());
        assert!(provider.health_check().await);
    }
}
