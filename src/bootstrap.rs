//! HTTP bootstrap fetch for stream connection settings.
//!
//! The bootstrap endpoint hands out the websocket URL, the stream credential
//! and the server build tag. [`StreamBootstrap::into_options`] turns the
//! response into [`StreamClientOptions`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::client::StreamClientOptions;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const BOOTSTRAP_PATH: &str = "/api/realtime/bootstrap";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootstrapDefaults;

impl BootstrapDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(200);
    pub const MAX_BACKOFF: Duration = Duration::from_millis(1_000);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct BootstrapClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for BootstrapClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: BootstrapDefaults::CONNECT_TIMEOUT,
            attempt_timeout: BootstrapDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: BootstrapDefaults::MAX_ATTEMPTS,
                initial_backoff: BootstrapDefaults::BACKOFF,
                max_backoff: BootstrapDefaults::MAX_BACKOFF,
                jitter: BootstrapDefaults::JITTER,
            },
        }
    }
}

/// Stream settings returned by the bootstrap endpoint.
#[derive(Clone, Debug)]
pub struct StreamBootstrap {
    pub ws_url: String,
    pub token: SecretString,
    pub build: Option<String>,
}

impl StreamBootstrap {
    pub fn into_options(self) -> StreamClientOptions {
        let options = StreamClientOptions::new(self.ws_url, self.token);
        match self.build {
            Some(build) => options.with_build_tag(build),
            None => options,
        }
    }
}

#[derive(Clone)]
pub struct BootstrapClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl BootstrapClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BootstrapError> {
        Self::with_options(base_url, BootstrapClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: BootstrapClientOptions,
    ) -> Result<Self, BootstrapError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(BootstrapError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end().trim_end_matches('/').to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Fetches stream settings, retrying transient failures.
    pub async fn fetch(&self) -> Result<StreamBootstrap, BootstrapError> {
        let endpoint = self.endpoint();
        retry_async(
            &self.retry_policy,
            |_| self.fetch_attempt(&endpoint),
            BootstrapError::is_retryable,
        )
        .await
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, BOOTSTRAP_PATH)
    }

    async fn fetch_attempt(&self, endpoint: &str) -> Result<StreamBootstrap, BootstrapError> {
        let response = self
            .http
            .get(endpoint)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(BootstrapError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(BootstrapError::Transport)?;

        if !status.is_success() {
            return Err(BootstrapError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_bootstrap_response(&body)
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl BootstrapError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BootstrapBody {
    #[serde(alias = "wsUrl", alias = "url")]
    ws_url: String,
    token: String,
    #[serde(default, alias = "version")]
    build: Option<String>,
}

fn parse_bootstrap_response(body: &str) -> Result<StreamBootstrap, BootstrapError> {
    let parsed: BootstrapBody =
        serde_json::from_str(body).map_err(|err| BootstrapError::Parse(err.to_string()))?;

    if parsed.ws_url.trim().is_empty() {
        return Err(BootstrapError::Parse("ws_url is empty".to_string()));
    }

    Ok(StreamBootstrap {
        ws_url: parsed.ws_url,
        token: SecretString::new(parsed.token),
        build: parsed.build.filter(|build| !build.is_empty()),
    })
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use secrecy::ExposeSecret;

    use super::{
        parse_bootstrap_response, summarize_error_body, BootstrapClient, BootstrapError,
        BOOTSTRAP_PATH,
    };

    #[test]
    fn parses_full_bootstrap_body() {
        let parsed = parse_bootstrap_response(
            r#"{"ws_url":"ws://127.0.0.1:4100/ws","token":"abc","build":"2024.06.1"}"#,
        )
        .expect("parse bootstrap");
        assert_eq!(parsed.ws_url, "ws://127.0.0.1:4100/ws");
        assert_eq!(parsed.token.expose_secret(), "abc");
        assert_eq!(parsed.build.as_deref(), Some("2024.06.1"));
    }

    #[test]
    fn accepts_camel_case_url_and_missing_build() {
        let parsed = parse_bootstrap_response(r#"{"wsUrl":"wss://x/ws","token":"t"}"#)
            .expect("parse bootstrap");
        assert_eq!(parsed.ws_url, "wss://x/ws");
        assert!(parsed.build.is_none());
    }

    #[test]
    fn rejects_missing_token() {
        let error = parse_bootstrap_response(r#"{"ws_url":"wss://x/ws"}"#)
            .expect_err("token is required");
        assert!(matches!(error, BootstrapError::Parse(_)));
    }

    #[test]
    fn bootstrap_converts_into_stream_options() {
        let options = parse_bootstrap_response(
            r#"{"ws_url":"ws://localhost:4100/ws","token":"t k","build":"b1"}"#,
        )
        .expect("parse bootstrap")
        .into_options();
        assert_eq!(options.build_tag.as_deref(), Some("b1"));
        let url = options.endpoint_url().expect("endpoint url");
        assert_eq!(url.query(), Some("token=t+k"));
    }

    #[test]
    fn error_body_prefers_message_field() {
        assert_eq!(
            summarize_error_body(r#"{"error":"workspace not initialized"}"#),
            "workspace not initialized"
        );
        assert_eq!(summarize_error_body(&"x".repeat(500)).len(), 220);
    }

    #[test]
    fn retryable_statuses() {
        let server = BootstrapError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let throttled = BootstrapError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let missing = BootstrapError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!missing.is_retryable());
        assert!(!BootstrapError::Parse("bad".to_string()).is_retryable());
    }

    #[test]
    fn endpoint_joins_base_url_without_double_slash() {
        let client = BootstrapClient::new("http://127.0.0.1:4100/ ").expect("client");
        assert_eq!(
            client.endpoint(),
            format!("http://127.0.0.1:4100{BOOTSTRAP_PATH}")
        );
    }
}
