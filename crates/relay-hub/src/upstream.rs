use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1/v1/chat-messages";

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// Candidate endpoints, tried in order.
    pub endpoints: Vec<String>,
    pub api_key: Option<String>,
    pub user: String,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no upstream endpoints configured")]
    NoEndpoints,
    #[error("http client setup failed: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered {status}")]
    Status { endpoint: String, status: StatusCode },
    #[error("all {attempts} upstream endpoints failed, last: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<UpstreamError>,
    },
}

/// One query as the upstream service sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub query: String,
    pub conversation_id: Option<String>,
    pub helper: Option<String>,
    pub user: String,
}

impl UpstreamRequest {
    pub fn body(&self) -> Value {
        let mut inputs = Map::new();
        if let Some(helper) = self.helper.as_deref().filter(|tag| !tag.trim().is_empty()) {
            inputs.insert("helper".to_string(), Value::String(helper.to_string()));
        }
        let mut body = json!({
            "inputs": inputs,
            "query": self.query,
            "response_mode": "streaming",
            "user": self.user,
        });
        if let Some(conversation_id) = self.conversation_id.as_deref() {
            body["conversation_id"] = Value::String(conversation_id.to_string());
        }
        body
    }
}

/// A successfully opened upstream response.
pub struct OpenedStream {
    pub response: reqwest::Response,
    pub endpoint: String,
    /// The cached upstream session was rejected and the request went out without it.
    pub session_dropped: bool,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(UpstreamError::Client)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn request(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        helper: Option<&str>,
    ) -> UpstreamRequest {
        UpstreamRequest {
            query: query.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            helper: helper.map(str::to_string),
            user: self.config.user.clone(),
        }
    }

    /// Tries each candidate endpoint in order; the first 2xx response wins.
    pub async fn open(&self, request: &UpstreamRequest) -> Result<OpenedStream, UpstreamError> {
        let mut last = None;
        let mut attempts = 0;
        for endpoint in &self.config.endpoints {
            attempts += 1;
            match self.open_endpoint(endpoint, request).await {
                Ok(opened) => {
                    info!(
                        event = "upstream_open",
                        endpoint = %opened.endpoint,
                        attempt = attempts,
                        session_dropped = opened.session_dropped
                    );
                    return Ok(opened);
                }
                Err(err) => {
                    warn!(event = "upstream_candidate_failed", endpoint = %endpoint, error = %err);
                    last = Some(err);
                }
            }
        }
        match last {
            Some(err) => Err(UpstreamError::Exhausted {
                attempts,
                last: Box::new(err),
            }),
            None => Err(UpstreamError::NoEndpoints),
        }
    }

    async fn open_endpoint(
        &self,
        endpoint: &str,
        request: &UpstreamRequest,
    ) -> Result<OpenedStream, UpstreamError> {
        let response = self.send(endpoint, request).await?;
        if response.status().is_success() {
            return Ok(OpenedStream {
                response,
                endpoint: endpoint.to_string(),
                session_dropped: false,
            });
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && request.conversation_id.is_some() {
            debug!(event = "upstream_session_rejected", endpoint = %endpoint);
            let retry = UpstreamRequest {
                conversation_id: None,
                ..request.clone()
            };
            let response = self.send(endpoint, &retry).await?;
            if response.status().is_success() {
                return Ok(OpenedStream {
                    response,
                    endpoint: endpoint.to_string(),
                    session_dropped: true,
                });
            }
            return Err(UpstreamError::Status {
                endpoint: endpoint.to_string(),
                status: response.status(),
            });
        }

        Err(UpstreamError::Status {
            endpoint: endpoint.to_string(),
            status,
        })
    }

    async fn send(
        &self,
        endpoint: &str,
        request: &UpstreamRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut builder = self
            .http
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body());
        if let Some(api_key) = self.config.api_key.as_deref() {
            builder = builder.bearer_auth(api_key);
        }
        builder
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })
    }
}

/// Ends the stream when no chunk arrives within `idle`. A zero duration
/// disables the limit.
pub fn with_idle_timeout<S>(
    source: S,
    idle: Duration,
) -> BoxStream<'static, Result<Bytes, reqwest::Error>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let source = source.boxed();
    if idle.is_zero() {
        return source;
    }
    stream::unfold(source, move |mut source| async move {
        match tokio::time::timeout(idle, source.next()).await {
            Ok(Some(item)) => Some((item, source)),
            Ok(None) => None,
            Err(_) => {
                warn!(event = "upstream_idle_timeout", idle_ms = idle.as_millis() as u64);
                None
            }
        }
    })
    .boxed()
}

/// Splits a comma separated endpoint list, dropping blanks and repeats.
pub fn parse_endpoints<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut endpoints: Vec<String> = Vec::new();
    for value in values {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || endpoints.iter().any(|known| known == part) {
                continue;
            }
            endpoints.push(part.to_string());
        }
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            query: "hello".to_string(),
            conversation_id: None,
            helper: None,
            user: "local-user".to_string(),
        }
    }

    #[test]
    fn body_omits_conversation_id_until_one_is_cached() {
        let body = request().body();
        assert_eq!(body["query"], "hello");
        assert_eq!(body["response_mode"], "streaming");
        assert_eq!(body["user"], "local-user");
        assert_eq!(body["inputs"], json!({}));
        assert!(body.get("conversation_id").is_none());

        let cached = UpstreamRequest {
            conversation_id: Some("up-1".to_string()),
            helper: Some("coder".to_string()),
            ..request()
        };
        let body = cached.body();
        assert_eq!(body["conversation_id"], "up-1");
        assert_eq!(body["inputs"]["helper"], "coder");
    }

    #[test]
    fn endpoints_keep_order_and_drop_blanks() {
        let endpoints = parse_endpoints([
            "http://a/v1/chat-messages, http://b/v1/chat-messages",
            " ",
            "http://a/v1/chat-messages",
            "http://c/chat-messages",
        ]);
        assert_eq!(
            endpoints,
            vec![
                "http://a/v1/chat-messages".to_string(),
                "http://b/v1/chat-messages".to_string(),
                "http://c/chat-messages".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn empty_candidate_list_is_an_error() {
        let client = UpstreamClient::new(UpstreamConfig {
            endpoints: Vec::new(),
            api_key: None,
            user: "u".to_string(),
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
        })
        .expect("client");
        assert!(matches!(
            client.open(&request()).await,
            Err(UpstreamError::NoEndpoints)
        ));
    }

    #[tokio::test]
    async fn idle_timeout_ends_a_stalled_stream() {
        let stalled = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from_static(
            b"data: {}\n",
        ))])
            .chain(stream::pending());
        let mut limited = with_idle_timeout(stalled, Duration::from_millis(20));
        assert!(matches!(limited.next().await, Some(Ok(_))));
        assert!(limited.next().await.is_none());
    }
}
