//! Inference streaming contracts
//!
//! An inference worker is reached through an [`InferenceConnector`], which
//! dials long-lived [`InferenceConnection`]s. A connection opens one
//! bidirectional stream per request and yields backend frames
//! ([`InferenceChunk`]). The [`InferenceService`] facade turns that into a
//! channel of uniform [`GeneratedToken`] events.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("llm backend address is empty")]
    EmptyAddress,

    #[error("dial {address}: {message}")]
    Dial { address: String, message: String },

    #[error("start stream: {0}")]
    StreamSetup(String),

    #[error("send request: {0}")]
    Send(String),

    #[error("stream receive: {0}")]
    Receive(String),
}

pub type InferenceResult<T> = Result<T, InferenceError>;

/// The single request frame sent to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub session_id: String,
    pub message: String,
}

/// One response frame as produced by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceChunk {
    pub chunk: String,
    pub is_finished: bool,
    pub error: String,
    pub generated_tokens: i32,
}

/// Uniform event relayed to callers of [`InferenceService::stream`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedToken {
    pub content: String,
    pub is_last: bool,
    pub error: Option<String>,
    pub count: i32,
}

impl GeneratedToken {
    /// Terminal error event.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            is_last: true,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl From<InferenceChunk> for GeneratedToken {
    fn from(chunk: InferenceChunk) -> Self {
        Self {
            content: chunk.chunk,
            is_last: chunk.is_finished,
            error: (!chunk.error.is_empty()).then_some(chunk.error),
            count: chunk.generated_tokens,
        }
    }
}

/// Frames coming back from one backend stream.
pub type ChunkStream = BoxStream<'static, InferenceResult<InferenceChunk>>;

/// A dialed, reusable connection to one backend.
#[async_trait]
pub trait InferenceConnection: Clone + Send + Sync + 'static {
    /// `true` once the connection has been torn down and must be redialed.
    fn is_closed(&self) -> bool;

    /// Open a bidirectional stream and send `request` as its only frame.
    async fn open_stream(&self, request: InferenceRequest) -> InferenceResult<ChunkStream>;
}

/// Dials connections to backends by `host:port` address.
#[async_trait]
pub trait InferenceConnector: Send + Sync + 'static {
    type Connection: InferenceConnection;

    async fn connect(&self, address: &str) -> InferenceResult<Self::Connection>;
}

/// Streaming facade used by the chat orchestrator.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Start generation on `address` and return the token channel. The
    /// channel closes after the last token or after a single error token.
    /// Cancelling `cancel` (or dropping the receiver) stops the producer.
    async fn stream(
        &self,
        address: &str,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<mpsc::Receiver<GeneratedToken>>;
}

pub type DynInferenceService = Arc<dyn InferenceService>;
