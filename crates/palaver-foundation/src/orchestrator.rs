//! 聊天编排
//! Chat orchestration
//!
//! 每个请求的流程：解析会话 → 保存用户消息 → 构建上下文 → 选择后端 →
//! 流式推理并转发 → 异步保存助手回复。后端负载计数在任何退出路径上都会释放。
//! Per request: resolve the session, persist the user turn, build context,
//! select a backend, relay the inference stream, then save the assistant
//! turn in the background. The backend's load unit is given back on every
//! exit path.

use crate::background::BackgroundTasks;
use crate::balancer::ModelLoadBalancer;
use crate::duration_serde::secs;
use crate::metrics::ChatMetrics;
use crate::repository::{ConversationRepository, DEFAULT_TITLE_CHARS};
use palaver_kernel::chat::{ChatEvent, ChatRequest};
use palaver_kernel::conversation::{Message, Role, Session, render_context};
use palaver_kernel::error::{ChatError, ChatResult};
use palaver_kernel::inference::{DynInferenceService, GeneratedToken, InferenceRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// 编排参数
/// Orchestration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Recent messages handed to the backend as context.
    pub context_window: usize,
    /// Bound for titles derived from a first message.
    pub session_title_chars: usize,
    /// Bound for titles given explicitly to `create_session`.
    pub explicit_title_chars: usize,
    /// Budget for detached cleanup (load release, assistant save).
    #[serde(with = "secs")]
    pub cleanup_timeout: Duration,
    pub background_concurrency: usize,
    /// Capacity of the client-facing event channel.
    pub event_buffer: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            context_window: 10,
            session_title_chars: DEFAULT_TITLE_CHARS,
            explicit_title_chars: 50,
            cleanup_timeout: Duration::from_secs(5),
            background_concurrency: 64,
            event_buffer: 16,
        }
    }
}

/// 后端占用凭据
/// Holds one unit of a backend's load until dropped
///
/// Dropping submits the release to the background pool with its own
/// timeout, so it runs even when the request was cancelled.
struct BackendLease {
    balancer: ModelLoadBalancer,
    tasks: BackgroundTasks,
    model: String,
    address: String,
    timeout: Duration,
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        let balancer = self.balancer.clone();
        let model = std::mem::take(&mut self.model);
        let address = std::mem::take(&mut self.address);
        let timeout = self.timeout;
        self.tasks.spawn("release_backend", async move {
            match tokio::time::timeout(timeout, balancer.release(&model, &address)).await {
                Ok(Ok(())) => debug!(%model, backend = %address, "backend released"),
                Ok(Err(e)) => error!(%model, backend = %address, "release backend failed: {e}"),
                Err(_) => error!(%model, backend = %address, "release backend timed out"),
            }
        });
    }
}

/// 聊天编排器
/// Chat orchestrator
pub struct ChatOrchestrator {
    repo: Arc<ConversationRepository>,
    balancer: ModelLoadBalancer,
    inference: DynInferenceService,
    tasks: BackgroundTasks,
    metrics: Option<Arc<ChatMetrics>>,
    settings: ChatSettings,
    /// Parent of every stream's stop token.
    shutdown: CancellationToken,
    streams: TaskTracker,
}

impl ChatOrchestrator {
    pub fn new(
        repo: Arc<ConversationRepository>,
        balancer: ModelLoadBalancer,
        inference: DynInferenceService,
        tasks: BackgroundTasks,
        settings: ChatSettings,
    ) -> Self {
        Self {
            repo,
            balancer,
            inference,
            tasks,
            metrics: None,
            settings,
            shutdown: CancellationToken::new(),
            streams: TaskTracker::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ChatMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn repository(&self) -> &ConversationRepository {
        &self.repo
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.chat_requests.with_label_values(&[outcome]).inc();
        }
    }

    // ========================================================================
    // 流式对话
    // Streaming chat
    // ========================================================================

    /// 发起一次流式对话
    /// Start one streaming chat turn
    ///
    /// Failures before the first token are returned as `Err`. Once the
    /// receiver is handed out, a backend failure arrives as a final event
    /// with `error` set and partial output is not persisted. Cancelling
    /// `cancel` or dropping the receiver stops the backend stream.
    #[instrument(
        skip(self, request, cancel),
        fields(user_id = %request.user_id, model = %request.model_name, session_id = tracing::field::Empty)
    )]
    pub async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ChatResult<mpsc::Receiver<ChatEvent>> {
        let started = self.start_stream(request, cancel).await;
        if let Err(e) = &started {
            warn!("chat request failed: {e}");
            self.record_outcome(e.code());
        }
        started
    }

    async fn start_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ChatResult<mpsc::Receiver<ChatEvent>> {
        validate(&request)?;

        let session_id = self
            .repo
            .ensure_session(&request.user_id, request.existing_session(), &request.message)
            .await?;
        tracing::Span::current().record("session_id", session_id.as_str());

        self.repo
            .save_message(&session_id, &request.user_id, Role::User, &request.message)
            .await?;

        let context = self.build_context(&session_id).await;

        let address = self.balancer.select(&request.model_name).await?;
        let lease = BackendLease {
            balancer: self.balancer.clone(),
            tasks: self.tasks.clone(),
            model: request.model_name.clone(),
            address: address.clone(),
            timeout: self.settings.cleanup_timeout,
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .backend_selections
                .with_label_values(&[request.model_name.as_str(), address.as_str()])
                .inc();
        }

        let stop = self.shutdown.child_token();
        let inference_request = InferenceRequest {
            session_id: session_id.clone(),
            message: context.unwrap_or_else(|| request.message.clone()),
        };
        let tokens = self
            .inference
            .stream(&address, inference_request, stop.clone())
            .await?;
        info!(session_id = %session_id, backend = %address, "inference stream opened");

        let (tx, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        let relay = Relay {
            repo: self.repo.clone(),
            tasks: self.tasks.clone(),
            metrics: self.metrics.clone(),
            cleanup_timeout: self.settings.cleanup_timeout,
            session_id,
            user_id: request.user_id,
            lease,
        };
        self.streams.spawn(relay.run(tokens, tx, cancel, stop));
        Ok(rx)
    }

    /// Recent history as context JSON. Failures only cost the context.
    async fn build_context(&self, session_id: &str) -> Option<String> {
        let recent = match self
            .repo
            .get_session_messages(session_id, self.settings.context_window, 0)
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!(session_id, "loading context failed, sending message alone: {e}");
                return None;
            }
        };
        match render_context(&recent) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(session_id, "encoding context failed, sending message alone: {e}");
                None
            }
        }
    }

    // ========================================================================
    // 会话管理
    // Session management
    // ========================================================================

    /// 创建会话，标题为空时使用默认标题
    /// Create a session with an explicit title
    #[instrument(skip(self, title))]
    pub async fn create_session(&self, user_id: &str, title: &str) -> ChatResult<Session> {
        require("user_id", user_id)?;
        let session = Session::new(user_id, title, self.settings.explicit_title_chars);
        self.repo.save_session(&session).await?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// 获取会话历史（最新在前）
    /// Chat history of an existing session, newest first
    #[instrument(skip(self))]
    pub async fn get_chat_history(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> ChatResult<Vec<Message>> {
        require("session_id", session_id)?;
        self.repo.get_session(session_id).await?;
        self.repo.get_session_messages(session_id, limit, offset).await
    }

    pub async fn get_user_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> ChatResult<Vec<Session>> {
        require("user_id", user_id)?;
        self.repo.get_user_sessions(user_id, limit, offset).await
    }

    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str, user_id: &str) -> ChatResult<()> {
        require("session_id", session_id)?;
        require("user_id", user_id)?;
        self.repo.delete_session(session_id, user_id).await?;
        info!("session deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        require("message_id", message_id)?;
        self.repo.delete_message(message_id).await
    }

    /// Cancel every in-flight stream, and any started afterwards.
    pub fn cancel_streams(&self) {
        self.shutdown.cancel();
    }

    /// 停止所有进行中的流并等待后台任务
    /// Stop in-flight streams, then drain background jobs
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.streams.close();
        let deadline = tokio::time::Instant::now() + timeout;
        if tokio::time::timeout_at(deadline, self.streams.wait()).await.is_err() {
            warn!("chat streams still running at shutdown");
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.tasks.shutdown(remaining).await
    }
}

fn require(field: &str, value: &str) -> ChatResult<()> {
    if value.trim().is_empty() {
        return Err(ChatError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

fn validate(request: &ChatRequest) -> ChatResult<()> {
    require("user_id", &request.user_id)?;
    require("message", &request.message)?;
    require("model_name", &request.model_name)
}

/// Relays one backend stream to one client.
struct Relay {
    repo: Arc<ConversationRepository>,
    tasks: BackgroundTasks,
    metrics: Option<Arc<ChatMetrics>>,
    cleanup_timeout: Duration,
    session_id: String,
    user_id: String,
    lease: BackendLease,
}

enum RelayEnd {
    Finished,
    Failed,
    Abandoned,
}

impl Relay {
    async fn run(
        self,
        mut tokens: mpsc::Receiver<GeneratedToken>,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
        stop: CancellationToken,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.inflight_streams.inc();
        }

        let mut reply = String::new();
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break RelayEnd::Abandoned,
                _ = stop.cancelled() => break RelayEnd::Abandoned,
                _ = tx.closed() => break RelayEnd::Abandoned,
                next = tokens.recv() => next,
            };

            // A producer that closes without a final token still ends the turn.
            let Some(token) = next else {
                let last = ChatEvent {
                    session_id: self.session_id.clone(),
                    is_finished: true,
                    ..Default::default()
                };
                if !self.send(&tx, last, &cancel, &stop).await {
                    break RelayEnd::Abandoned;
                }
                break RelayEnd::Finished;
            };

            if let Some(message) = token.error {
                error!(session_id = %self.session_id, "inference stream failed: {message}");
                let failure = ChatEvent {
                    session_id: self.session_id.clone(),
                    is_finished: true,
                    error: Some(ChatError::Backend(message).to_string()),
                    ..Default::default()
                };
                self.send(&tx, failure, &cancel, &stop).await;
                break RelayEnd::Failed;
            }

            reply.push_str(&token.content);
            if let Some(metrics) = &self.metrics {
                metrics.streamed_tokens.inc();
            }
            let event = ChatEvent {
                session_id: self.session_id.clone(),
                content: token.content,
                is_finished: token.is_last,
                error: None,
                generated_tokens: token.count,
            };
            if !self.send(&tx, event, &cancel, &stop).await {
                break RelayEnd::Abandoned;
            }
            if token.is_last {
                break RelayEnd::Finished;
            }
        };
        stop.cancel();

        let outcome = match end {
            RelayEnd::Finished => {
                self.save_reply(reply);
                "ok"
            }
            RelayEnd::Failed => "BACKEND_ERROR",
            RelayEnd::Abandoned => {
                debug!(session_id = %self.session_id, "client went away, reply discarded");
                "cancelled"
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.inflight_streams.dec();
            metrics.chat_requests.with_label_values(&[outcome]).inc();
        }

        // Cleanup is submitted before the client channel closes.
        drop(self.lease);
        drop(tx);
    }

    /// Deliver one event unless the client or the server gives up first.
    async fn send(
        &self,
        tx: &mpsc::Sender<ChatEvent>,
        event: ChatEvent,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = stop.cancelled() => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }

    fn save_reply(&self, reply: String) {
        if reply.is_empty() {
            return;
        }
        let repo = self.repo.clone();
        let session_id = self.session_id.clone();
        let user_id = self.user_id.clone();
        let timeout = self.cleanup_timeout;
        self.tasks.spawn("save_assistant_turn", async move {
            let saved = tokio::time::timeout(
                timeout,
                repo.save_message(&session_id, &user_id, Role::Assistant, &reply),
            )
            .await;
            match saved {
                Ok(Ok(message)) => {
                    debug!(%session_id, message_id = %message.id, "assistant turn saved")
                }
                Ok(Err(e)) => error!(%session_id, "assistant turn lost: {e}"),
                Err(_) => error!(%session_id, "assistant turn lost: save timed out"),
            }
        });
    }
}
