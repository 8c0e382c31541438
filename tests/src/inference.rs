//! Scripted inference backend
//!
//! [`ScriptedConnector`] implements the connector contract, so tests drive
//! the real gateway (pooling, channel relay, cancellation) against a backend
//! whose frames are fixed up front.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use palaver_kernel::inference::{
    ChunkStream, InferenceChunk, InferenceConnection, InferenceConnector, InferenceError,
    InferenceRequest, InferenceResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Frame = InferenceResult<InferenceChunk>;

#[derive(Default)]
struct Script {
    frames: Mutex<Vec<Frame>>,
    /// Leave the stream open after the scripted frames.
    hang: AtomicBool,
    refuse: AtomicBool,
    dials: AtomicUsize,
    requests: Mutex<Vec<(String, InferenceRequest)>>,
}

/// One content frame.
pub fn chunk(text: &str) -> Frame {
    Ok(InferenceChunk {
        chunk: text.to_string(),
        generated_tokens: 1,
        ..Default::default()
    })
}

/// Closing frame with no content.
pub fn finished() -> Frame {
    Ok(InferenceChunk {
        is_finished: true,
        ..Default::default()
    })
}

/// Frame carrying a backend-reported error.
pub fn backend_error(message: &str) -> Frame {
    Ok(InferenceChunk {
        error: message.to_string(),
        ..Default::default()
    })
}

/// Connector whose every stream replays the same script.
///
/// Clones share the script, so a test keeps one handle while the gateway
/// owns another.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `tokens` followed by a finished frame.
    pub fn replying(tokens: &[&str]) -> Self {
        let connector = Self::new();
        connector.reply_with(tokens);
        connector
    }

    pub fn reply_with(&self, tokens: &[&str]) {
        let mut frames: Vec<Frame> = tokens.iter().map(|t| chunk(t)).collect();
        frames.push(finished());
        self.set_frames(frames);
    }

    pub fn set_frames(&self, frames: Vec<Frame>) {
        *self.script.frames.lock() = frames;
    }

    /// Emit `tokens`, then fail the transport with `message`.
    pub fn fail_after(&self, tokens: &[&str], message: &str) {
        let mut frames: Vec<Frame> = tokens.iter().map(|t| chunk(t)).collect();
        frames.push(Err(InferenceError::Receive(message.to_string())));
        self.set_frames(frames);
    }

    /// Keep streams open after the scripted frames until cancelled.
    pub fn hang(&self, hang: bool) {
        self.script.hang.store(hang, Ordering::SeqCst);
    }

    /// Make every dial fail.
    pub fn refuse_dials(&self, refuse: bool) {
        self.script.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.script.dials.load(Ordering::SeqCst)
    }

    /// Every `(address, request)` a stream was opened with, in order.
    pub fn requests(&self) -> Vec<(String, InferenceRequest)> {
        self.script.requests.lock().clone()
    }
}

#[async_trait]
impl InferenceConnector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self, address: &str) -> InferenceResult<ScriptedConnection> {
        self.script.dials.fetch_add(1, Ordering::SeqCst);
        if self.script.refuse.load(Ordering::SeqCst) {
            return Err(InferenceError::Dial {
                address: address.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(ScriptedConnection {
            script: self.script.clone(),
            address: address.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct ScriptedConnection {
    script: Arc<Script>,
    address: String,
}

#[async_trait]
impl InferenceConnection for ScriptedConnection {
    fn is_closed(&self) -> bool {
        false
    }

    async fn open_stream(&self, request: InferenceRequest) -> InferenceResult<ChunkStream> {
        self.script
            .requests
            .lock()
            .push((self.address.clone(), request));

        let frames = self.script.frames.lock().clone();
        let replay = stream::iter(frames);
        if self.script.hang.load(Ordering::SeqCst) {
            Ok(replay.chain(stream::pending()).boxed())
        } else {
            Ok(replay.boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_one_script() {
        let connector = ScriptedConnector::replying(&["a"]);
        let handle = connector.clone();

        let conn = connector.connect("10.0.0.1:8083").await.unwrap();
        let frames: Vec<_> = conn
            .open_stream(InferenceRequest {
                session_id: "s1".into(),
                message: "hi".into(),
            })
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(handle.dial_count(), 1);
        assert_eq!(handle.requests()[0].0, "10.0.0.1:8083");
    }

    #[tokio::test]
    async fn refused_dials_are_counted() {
        let connector = ScriptedConnector::new();
        connector.refuse_dials(true);
        assert!(connector.connect("x:1").await.is_err());
        assert_eq!(connector.dial_count(), 1);
    }
}
