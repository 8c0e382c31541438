//! Prometheus 指标
//! Prometheus metrics

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 聊天服务指标
/// Chat service metrics
#[derive(Clone)]
pub struct ChatMetrics {
    registry: Registry,
    /// Requests by outcome: `ok`, `cancelled`, or the error code that ended the request.
    pub chat_requests: IntCounterVec,
    pub streamed_tokens: IntCounter,
    /// Writes that bypassed the queue and hit the database directly.
    pub queue_fallback_writes: IntCounter,
    /// Cache failures by operation.
    pub cache_errors: IntCounterVec,
    pub backend_selections: IntCounterVec,
    pub inflight_streams: IntGauge,
}

impl ChatMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("palaver".to_string()), None)?;

        let chat_requests = IntCounterVec::new(
            Opts::new("chat_requests_total", "Chat stream requests by outcome"),
            &["outcome"],
        )?;
        let streamed_tokens =
            IntCounter::new("streamed_tokens_total", "Tokens relayed to clients")?;
        let queue_fallback_writes = IntCounter::new(
            "queue_fallback_writes_total",
            "Writes persisted synchronously after a queue publish failure",
        )?;
        let cache_errors = IntCounterVec::new(
            Opts::new("cache_errors_total", "Cache tier failures by operation"),
            &["op"],
        )?;
        let backend_selections = IntCounterVec::new(
            Opts::new("backend_selections_total", "Backend selections by model and backend"),
            &["model", "backend"],
        )?;
        let inflight_streams =
            IntGauge::new("inflight_streams", "Chat streams currently in progress")?;

        registry.register(Box::new(chat_requests.clone()))?;
        registry.register(Box::new(streamed_tokens.clone()))?;
        registry.register(Box::new(queue_fallback_writes.clone()))?;
        registry.register(Box::new(cache_errors.clone()))?;
        registry.register(Box::new(backend_selections.clone()))?;
        registry.register(Box::new(inflight_streams.clone()))?;

        Ok(Self {
            registry,
            chat_requests,
            streamed_tokens,
            queue_fallback_writes,
            cache_errors,
            backend_selections,
            inflight_streams,
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("failed to encode metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
