//! Resilient client for the upstream conversational backend.
//!
//! Every network attempt holds one slot of a FIFO semaphore from the moment
//! the request is issued until its response (including a streamed body) is
//! fully drained. Slots are released while backing off. Chat requests get one
//! bounded fallback onto a fresh session; there is no recursion, so a single
//! logical call makes at most `max_attempts + 1` respond calls.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_retry::RetryIf;

use crate::models::Session;
use crate::retry::{ErrorClass, RetryPolicy};

/// Text returned when the backend completes a reply with no content.
pub const EMPTY_REPLY_TEXT: &str = "I apologize, but I couldn't generate a response.";

/// Text returned in place of an error once the retry budget is spent.
pub const DEGRADED_REPLY_TEXT: &str =
    "The assistant is temporarily unavailable. Please try again in a moment.";

/// Content sent for summarization is cut to this many characters.
const SUMMARY_INPUT_CHARS: usize = 4000;

/// Incremental reply fragments from the backend.
pub type ResponseStream = BoxStream<'static, Result<String, ClientError>>;

// ============================================================================
// Upstream trait
// ============================================================================

/// The hosted conversational backend, as seen by [`ServiceClient`].
///
/// `open`/`close` manage the connection pool and are only ever called by the
/// owning `ServiceClient`.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn open(&self) -> Result<(), ClientError> {
        Ok(())
    }

    fn close(&self) {}

    async fn create_session(&self) -> Result<Session, ClientError>;

    /// Start a reply. HTTP-level failures surface here; failures while the
    /// body is in flight surface as stream items.
    async fn respond(&self, session: &Session, query: &str) -> Result<ResponseStream, ClientError>;

    async fn ingest(&self, url: &str) -> Result<IngestAck, ClientError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Attempt timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Missing API token")]
    MissingToken,

    #[error("Service client is closed")]
    Closed,

    /// The conversation handle is gone on the backend (404/410 on a reply).
    #[error("Session expired ({status}): {message}")]
    SessionExpired { status: u16, message: String },

    #[error("Upstream unavailable after {attempts} attempts: {source}")]
    UpstreamUnavailable {
        attempts: usize,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Http(e) => {
                if e.is_builder() || e.is_redirect() || e.is_decode() {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Retryable
                }
            }
            ClientError::Api { status, .. } => match *status {
                408 | 425 | 429 => ErrorClass::Retryable,
                s if s >= 500 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            ClientError::SessionExpired { .. } => ErrorClass::SessionInvalid,
            ClientError::Timeout { .. } | ClientError::Stream(_) => ErrorClass::Retryable,
            ClientError::UpstreamUnavailable { .. } => ErrorClass::Retryable,
            ClientError::Decode(_) | ClientError::MissingToken | ClientError::Closed => {
                ErrorClass::Fatal
            }
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestAck {
    Accepted,
    /// The backend already has this source. Treated as success.
    AlreadyExists,
}

#[derive(Debug)]
pub enum ReplyStatus {
    Complete,
    /// Retry budget exhausted; carries the last underlying error.
    Degraded(ClientError),
}

#[derive(Debug)]
pub struct ChatReply {
    pub text: String,
    pub status: ReplyStatus,
    /// Set when the reply came from the fresh-session fallback. The caller
    /// owns persisting it.
    pub fresh_session: Option<Session>,
}

impl ChatReply {
    fn complete(text: String, fresh_session: Option<Session>) -> Self {
        let text = if text.trim().is_empty() {
            EMPTY_REPLY_TEXT.to_string()
        } else {
            text
        };
        Self {
            text,
            status: ReplyStatus::Complete,
            fresh_session,
        }
    }

    fn degraded(cause: ClientError) -> Self {
        Self {
            text: DEGRADED_REPLY_TEXT.to_string(),
            status: ReplyStatus::Degraded(cause),
            fresh_session: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, ReplyStatus::Degraded(_))
    }
}

// ============================================================================
// ServiceClient
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Open,
    Closed,
}

pub struct ServiceClient {
    upstream: Arc<dyn Upstream>,
    gate: Arc<Semaphore>,
    concurrency: usize,
    policy: RetryPolicy,
    lifecycle: Mutex<Lifecycle>,
}

impl ServiceClient {
    pub fn new(upstream: Arc<dyn Upstream>, concurrency: usize, policy: RetryPolicy) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            upstream,
            gate: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            policy,
            lifecycle: Mutex::new(Lifecycle::New),
        }
    }

    /// Open the connection pool. Idempotent; also happens lazily on first use.
    pub async fn open(&self) -> Result<(), ClientError> {
        let mut state = self.lifecycle.lock().await;
        match *state {
            Lifecycle::Open => Ok(()),
            Lifecycle::Closed => Err(ClientError::Closed),
            Lifecycle::New => {
                self.upstream.open().await?;
                *state = Lifecycle::Open;
                tracing::info!(
                    backend = self.upstream.name(),
                    concurrency = self.concurrency,
                    max_attempts = self.policy.max_attempts,
                    "Service client opened"
                );
                Ok(())
            }
        }
    }

    /// Release the pool. Queued callers fail with [`ClientError::Closed`];
    /// attempts already in flight run to completion.
    pub async fn close(&self) {
        let mut state = self.lifecycle.lock().await;
        if *state == Lifecycle::Closed {
            return;
        }
        self.gate.close();
        self.upstream.close();
        *state = Lifecycle::Closed;
        tracing::info!(backend = self.upstream.name(), "Service client closed");
    }

    pub async fn is_open(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Open
    }

    /// Calls currently holding a gate slot.
    pub fn in_flight(&self) -> usize {
        self.concurrency
            .saturating_sub(self.gate.available_permits())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn create_session(&self) -> Result<Session, ClientError> {
        self.ensure_open().await?;
        let attempts = AtomicUsize::new(0);
        self.with_retry("create_session", &attempts, || self.create_session_once())
            .await
            .map_err(|e| exhausted(e, &attempts))
    }

    /// Ask the backend for a reply on `session`.
    ///
    /// Fatal failures on the primary session are returned as `Err`. Anything
    /// else that outlasts the retry budget and the single fresh-session
    /// fallback becomes a degraded reply.
    pub async fn get_response(
        &self,
        session: &Session,
        message: &str,
        context: Option<&str>,
    ) -> Result<ChatReply, ClientError> {
        self.ensure_open().await?;
        let query = compose_query(message, context);
        let attempts = AtomicUsize::new(0);

        let mut current = session.clone();
        let mut fresh: Option<Session> = None;
        let mut used_fallback = false;

        loop {
            let result = if used_fallback {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.respond_once(&current, &query).await
            } else {
                self.with_retry("respond", &attempts, || self.respond_once(&current, &query))
                    .await
            };

            let err = match result {
                Ok(text) => return Ok(ChatReply::complete(text, fresh)),
                Err(e) => e,
            };

            if used_fallback {
                tracing::error!(
                    session = %current.id,
                    attempts = attempts.load(Ordering::SeqCst),
                    error = %err,
                    "Fresh-session fallback failed, returning degraded reply"
                );
                return Ok(ChatReply::degraded(exhausted(err, &attempts)));
            }

            if err.class() == ErrorClass::Fatal {
                tracing::error!(session = %session.id, error = %err, "Fatal upstream error");
                return Err(err);
            }

            tracing::warn!(
                session = %session.id,
                class = ?err.class(),
                error = %err,
                "Primary session failed, retrying once on a fresh session"
            );
            used_fallback = true;

            match self.create_session_once().await {
                Ok(s) => {
                    current = s.clone();
                    fresh = Some(s);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Could not create fallback session");
                    return Ok(ChatReply::degraded(exhausted(e, &attempts)));
                }
            }
        }
    }

    /// Add a URL to the knowledge base. Re-uploading a known URL is a success.
    pub async fn upload_source(&self, url: &str) -> Result<IngestAck, ClientError> {
        self.ensure_open().await?;
        let attempts = AtomicUsize::new(0);
        let ack = self
            .with_retry("upload_source", &attempts, || self.ingest_once(url))
            .await
            .map_err(|e| exhausted(e, &attempts))?;
        tracing::debug!(url, ?ack, "Knowledge base source uploaded");
        Ok(ack)
    }

    /// Ask the backend for a short structured summary of `content`, on a
    /// throwaway session. `Ok(None)` when the backend had nothing to say.
    pub async fn summarize(&self, content: &str) -> Result<Option<String>, ClientError> {
        let excerpt: String = content.chars().take(SUMMARY_INPUT_CHARS).collect();
        if excerpt.trim().is_empty() {
            return Ok(None);
        }

        let session = self.create_session().await?;
        let prompt = format!(
            "Please summarize this content:\n\n{}",
            excerpt
        );
        let reply = self.get_response(&session, &prompt, None).await?;
        match reply.status {
            ReplyStatus::Degraded(cause) => Err(cause),
            ReplyStatus::Complete if reply.text == EMPTY_REPLY_TEXT => Ok(None),
            ReplyStatus::Complete => Ok(Some(reply.text.trim().to_string())),
        }
    }

    async fn ensure_open(&self) -> Result<(), ClientError> {
        self.open().await
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ClientError> {
        self.gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let after = self.policy.attempt_timeout;
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| ClientError::Timeout { after })?
    }

    async fn create_session_once(&self) -> Result<Session, ClientError> {
        let _permit = self.acquire().await?;
        self.timed(self.upstream.create_session()).await
    }

    async fn ingest_once(&self, url: &str) -> Result<IngestAck, ClientError> {
        let _permit = self.acquire().await?;
        self.timed(self.upstream.ingest(url)).await
    }

    /// One respond call. The permit is held until the stream ends, and only
    /// the fully accumulated text is returned.
    async fn respond_once(&self, session: &Session, query: &str) -> Result<String, ClientError> {
        let _permit = self.acquire().await?;
        let upstream = self.upstream.clone();
        self.timed(async move {
            let mut stream = upstream.respond(session, query).await?;
            let mut text = String::new();
            while let Some(fragment) = stream.next().await {
                text.push_str(&fragment?);
            }
            Ok(text)
        })
        .await
        .map_err(session_scoped)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        attempts: &AtomicUsize,
        mut call: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let action = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let started = Instant::now();
            let fut = call();
            async move {
                let result = fut.await;
                if let Err(e) = &result {
                    tracing::warn!(
                        op,
                        attempt,
                        class = ?e.class(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "Upstream attempt failed"
                    );
                }
                result
            }
        };

        RetryIf::start(self.policy.delays(), action, |e: &ClientError| {
            e.class().is_retryable()
        })
        .await
    }
}

fn exhausted(err: ClientError, attempts: &AtomicUsize) -> ClientError {
    match err.class() {
        ErrorClass::Fatal => err,
        _ => ClientError::UpstreamUnavailable {
            attempts: attempts.load(Ordering::SeqCst),
            source: Box::new(err),
        },
    }
}

/// A missing resource on a session endpoint means the session itself is gone.
/// Elsewhere (session create, data sources) it stays a fatal API error.
fn session_scoped(err: ClientError) -> ClientError {
    match err {
        ClientError::Api {
            status: status @ (404 | 410),
            message,
        } => ClientError::SessionExpired { status, message },
        other => other,
    }
}

fn compose_query(message: &str, context: Option<&str>) -> String {
    match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(ctx) => format!("{}\n\nUser: {}", ctx, message),
        None => format!("User: {}", message),
    }
}

// ============================================================================
// TESTS
// ============================================================================
