//! Ollama chat API client.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use crate::client::TextGenerator;
use crate::request::{ChatMessage, GenerationRequest, SamplingOptions};
use crate::result::{Generation, GenerationError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_WAIT: Duration = Duration::from_secs(30);

/// `[llm]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Chat endpoint, e.g. `http://localhost:11434/api/chat`.
    pub api_endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub request_timeout_secs: u64,
    /// Ask for JSON output even when a call carries no schema.
    pub json_mode: bool,
    /// Try `ollama serve` when the liveness probe fails at worker start.
    pub autostart: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        let sampling = SamplingOptions::default();
        Self {
            api_endpoint: "http://localhost:11434/api/chat".to_string(),
            model: "llama3".to_string(),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            request_timeout_secs: 360,
            json_mode: true,
            autostart: false,
        }
    }
}

impl OllamaConfig {
    pub fn sampling(&self) -> SamplingOptions {
        SamplingOptions {
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<JsonValue>,
    options: SamplingOptions,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    model: Option<String>,
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

/// HTTP client for a (usually local) Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    config: OllamaConfig,
    endpoint: Url,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, GenerationError> {
        let endpoint = Url::parse(&config.api_endpoint)
            .map_err(|e| GenerationError::Transport(format!("invalid api_endpoint: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn body<'a>(&'a self, request: &GenerationRequest) -> ChatBody<'a> {
        let format = match (&request.schema, self.config.json_mode) {
            (Some(schema), _) => Some(schema.clone()),
            (None, true) => Some(json!("json")),
            (None, false) => None,
        };

        ChatBody {
            model: &self.config.model,
            messages: request.messages(),
            stream: false,
            format,
            options: self.config.sampling(),
        }
    }

    fn tags_url(&self) -> Result<Url, GenerationError> {
        self.endpoint
            .join("/api/tags")
            .map_err(|e| GenerationError::Transport(e.to_string()))
    }

    /// Bounded-time liveness check (`GET /api/tags`).
    pub async fn probe(&self) -> Result<(), GenerationError> {
        let response = self
            .http
            .get(self.tags_url()?)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, PROBE_TIMEOUT))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status(), String::new()))
        }
    }

    /// Probe the server and, if it is down, try to start `ollama serve`.
    ///
    /// Returns whether the server answered in the end. Never fails: a worker can
    /// still start and let attempts fail (and retry) until the service is back.
    pub async fn ensure_running(&self) -> bool {
        if self.probe().await.is_ok() {
            return true;
        }

        info!("generation service not reachable; starting `ollama serve`");
        let spawned = tokio::process::Command::new("ollama")
            .arg("serve")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        if let Err(err) = spawned {
            warn!(error = %err, "failed to start ollama");
            return false;
        }

        let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.probe().await.is_ok() {
                info!("generation service is up");
                return true;
            }
        }

        warn!(waited = ?STARTUP_WAIT, "generation service did not come up");
        false
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    #[instrument(skip(self, request), fields(model = %self.config.model, schema = request.schema.is_some()), err)]
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let timeout = self.config.request_timeout();
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if reply.message.content.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }

        debug!(chars = reply.message.content.len(), "generation received");
        let generation = Generation::new(reply.message.content);
        Ok(match reply.model {
            Some(model) => generation.with_model(model),
            None => generation,
        })
    }
}

fn status_error(status: StatusCode, body: String) -> GenerationError {
    GenerationError::Status {
        status: status.as_u16(),
        body,
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout(timeout)
    } else if err.is_decode() {
        GenerationError::Decode(err.to_string())
    } else {
        GenerationError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use axum::routing::{get, post};
    use axum::{Json, Router};

    struct StubServer {
        base_url: String,
        seen: Arc<Mutex<Vec<JsonValue>>>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl StubServer {
        async fn spawn(status: StatusCode, reply: JsonValue) -> Self {
            let seen: Arc<Mutex<Vec<JsonValue>>> = Arc::default();
            let seen_clone = seen.clone();

            let app = Router::new()
                .route(
                    "/api/chat",
                    post(move |Json(body): Json<JsonValue>| {
                        let seen = seen_clone.clone();
                        let reply = reply.clone();
                        async move {
                            seen.lock().unwrap().push(body);
                            (status, Json(reply))
                        }
                    }),
                )
                .route("/api/tags", get(|| async { Json(json!({"models": []})) }));

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("failed to bind ephemeral port");
            let addr = listener.local_addr().unwrap();
            let handle = tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            Self {
                base_url: format!("http://{addr}"),
                seen,
                handle,
            }
        }

        fn client(&self) -> OllamaClient {
            OllamaClient::new(OllamaConfig {
                api_endpoint: format!("{}/api/chat", self.base_url),
                model: "test-model".into(),
                ..Default::default()
            })
            .unwrap()
        }
    }

    impl Drop for StubServer {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    #[tokio::test]
    async fn sends_conversation_and_returns_content() {
        let server = StubServer::spawn(
            StatusCode::OK,
            json!({"model": "test-model", "message": {"role": "assistant", "content": "{\"a\":1}"}, "done": true}),
        )
        .await;
        let client = server.client();

        let request = GenerationRequest::new("hi")
            .with_system(Some("be brief"))
            .with_schema(Some(json!({"type": "object"})));
        let generation = client.generate(&request).await.unwrap();

        assert_eq!(generation.text, "{\"a\":1}");
        assert_eq!(generation.model.as_deref(), Some("test-model"));

        let seen = server.seen.lock().unwrap();
        let body = &seen[0];
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["format"], json!({"type": "object"}));
        assert!(body["options"]["temperature"].is_number());
    }

    #[tokio::test]
    async fn json_mode_without_schema_requests_json_format() {
        let server = StubServer::spawn(
            StatusCode::OK,
            json!({"message": {"role": "assistant", "content": "ok"}}),
        )
        .await;
        server.client().generate(&GenerationRequest::new("hi")).await.unwrap();

        let seen = server.seen.lock().unwrap();
        assert_eq!(seen[0]["format"], "json");
        assert_eq!(seen[0]["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server =
            StubServer::spawn(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"})).await;
        let err = server
            .client()
            .generate(&GenerationRequest::new("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn empty_content_is_an_error() {
        let server = StubServer::spawn(
            StatusCode::OK,
            json!({"message": {"role": "assistant", "content": "  "}}),
        )
        .await;
        let err = server
            .client()
            .generate(&GenerationRequest::new("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::EmptyResponse));
    }

    #[tokio::test]
    async fn probe_hits_tags_endpoint() {
        let server = StubServer::spawn(StatusCode::OK, json!({})).await;
        server.client().probe().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        let client = OllamaClient::new(OllamaConfig {
            api_endpoint: "http://127.0.0.1:9/api/chat".into(),
            ..Default::default()
        })
        .unwrap();

        let err = client.generate(&GenerationRequest::new("hi")).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Transport(_) | GenerationError::Timeout(_)
        ));
    }
}
