//! GPT-Trainer HTTP backend for [`ServiceClient`](crate::client::ServiceClient).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

use crate::client::{ClientError, IngestAck, ResponseStream, Upstream};
use crate::config::UpstreamConfig;
use crate::models::Session;

// ============================================================================
// API structs (private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    uuid: String,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    query: &'a str,
}

#[derive(Debug, Serialize)]
struct DataSourceRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamFragment {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(alias = "error", alias = "detail")]
    message: Option<String>,
}

// ============================================================================
// Stream line decoding
// ============================================================================

/// Turns raw body bytes into reply text.
///
/// Complete lines are decoded as they arrive: an optional `data: ` prefix is
/// stripped, JSON objects contribute their `text` field and anything else is
/// passed through as plain text with its newline. Once an SSE `data:` line has
/// been seen, blank lines are event separators and dropped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    sse: bool,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.buf.extend_from_slice(chunk);
        let mut out = String::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.decode_line(line.trim_end_matches('\r'), true, &mut out);
        }
        out
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> String {
        let mut out = String::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest);
            self.decode_line(line.trim_end_matches('\r'), false, &mut out);
        }
        out
    }

    fn decode_line(&mut self, line: &str, had_newline: bool, out: &mut String) {
        let payload = match line.strip_prefix("data:") {
            Some(rest) => {
                self.sse = true;
                rest.strip_prefix(' ').unwrap_or(rest)
            }
            None => line,
        };

        if payload.trim() == "[DONE]" {
            return;
        }
        if payload.trim().is_empty() && (self.sse || !had_newline) {
            return;
        }

        if let Ok(fragment) = serde_json::from_str::<StreamFragment>(payload) {
            out.push_str(&fragment.text);
            return;
        }

        out.push_str(payload);
        if had_newline && !line.starts_with("data:") {
            out.push('\n');
        }
    }
}

// ============================================================================
// HttpUpstream
// ============================================================================

pub struct HttpUpstream {
    base_url: String,
    chatbot_uuid: String,
    api_token: String,
    connect_timeout: Duration,
    pool: RwLock<Option<Client>>,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ClientError> {
        Self::with_base_url(config, config.base_url.clone())
    }

    /// Create a backend with a custom base URL (for testing / integration)
    pub fn with_base_url(config: &UpstreamConfig, base_url: String) -> Result<Self, ClientError> {
        if config.api_token.trim().is_empty() {
            return Err(ClientError::MissingToken);
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            chatbot_uuid: config.chatbot_uuid.clone(),
            api_token: config.api_token.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            pool: RwLock::new(None),
        })
    }

    fn client(&self) -> Result<Client, ClientError> {
        self.pool
            .read()
            .map_err(|_| ClientError::Closed)?
            .clone()
            .ok_or(ClientError::Closed)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ClientError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client()?.post(&url).bearer_auth(&self.api_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }
}

async fn api_error(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorResponse>(&body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or(body);

    tracing::debug!(status, message = %message, "GPT-Trainer API error");
    ClientError::Api { status, message }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(&self) -> Result<(), ClientError> {
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        let mut pool = self.pool.write().map_err(|_| ClientError::Closed)?;
        if pool.is_none() {
            *pool = Some(client);
        }
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut pool) = self.pool.write() {
            pool.take();
        }
    }

    async fn create_session(&self) -> Result<Session, ClientError> {
        let path = format!("chatbot/{}/session/create", self.chatbot_uuid);
        let response = self.post_json::<()>(&path, None).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(Session::new(body.uuid))
    }

    async fn respond(&self, session: &Session, query: &str) -> Result<ResponseStream, ClientError> {
        let path = format!("session/{}/message/stream", session.id);
        let response = self
            .post_json(&path, Some(&MessageRequest { query }))
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let bytes = response.bytes_stream();
        let stream = futures::stream::unfold(
            (bytes, LineDecoder::default(), false),
            |(mut bytes, mut decoder, done)| async move {
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        let text = decoder.push(&chunk);
                        Some((Ok(text), (bytes, decoder, false)))
                    }
                    Some(Err(e)) => Some((
                        Err(ClientError::Stream(e.to_string())),
                        (bytes, decoder, true),
                    )),
                    None => {
                        let tail = decoder.finish();
                        Some((Ok(tail), (bytes, decoder, true)))
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn ingest(&self, url: &str) -> Result<IngestAck, ClientError> {
        let path = format!("chatbot/{}/data-source/url", self.chatbot_uuid);
        let response = self
            .post_json(&path, Some(&DataSourceRequest { url }))
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(IngestAck::AlreadyExists),
            s if s.is_success() => Ok(IngestAck::Accepted),
            _ => Err(api_error(response).await),
        }
    }

    fn name(&self) -> &str {
        "gpt-trainer"
    }
}

// ============================================================================
// TESTS
// ============================================================================
