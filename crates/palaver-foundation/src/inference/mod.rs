//! 推理网关
//! Inference gateway
//!
//! 按地址缓存长连接，每个请求打开一条双向流，把后端帧转成
//! [`GeneratedToken`] 写入容量为 1 的通道。
//! Pools one long-lived connection per backend address, opens a
//! bidirectional stream per request and relays backend frames as
//! [`GeneratedToken`]s over a capacity-1 channel.

mod grpc;

pub use grpc::{GrpcConnection, GrpcConnector, pb};

use crate::duration_serde::{millis, secs};
use async_trait::async_trait;
use futures::StreamExt;
use palaver_kernel::inference::{
    GeneratedToken, InferenceConnection, InferenceConnector, InferenceError, InferenceRequest,
    InferenceResult, InferenceService,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// 连接参数
/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub keepalive_interval: Duration,
    #[serde(with = "secs")]
    pub keepalive_timeout: Duration,
    /// Pooled connections unused for this long are redialed on next use.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3_000),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// 推理网关
/// Inference gateway
///
/// 连接池是网关自身持有的字段，读路径只取读锁；建连时取写锁并再次检查，
/// 防止并发重复建连。
/// The pool is owned by the gateway. Lookups take the read lock; dialing
/// takes the write lock and re-checks first so concurrent callers never
/// dial the same address twice.
pub struct InferenceGateway<C: InferenceConnector> {
    connector: C,
    pool: RwLock<HashMap<String, C::Connection>>,
}

impl<C: InferenceConnector> InferenceGateway<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            pool: RwLock::new(HashMap::new()),
        }
    }

    /// 获取（或建立）到 `address` 的连接
    /// Get the pooled connection for `address`, dialing if absent or closed
    pub async fn connection(&self, address: &str) -> InferenceResult<C::Connection> {
        {
            let pool = self.pool.read().await;
            if let Some(conn) = pool.get(address).filter(|c| !c.is_closed()) {
                return Ok(conn.clone());
            }
        }

        let mut pool = self.pool.write().await;
        if let Some(conn) = pool.get(address).filter(|c| !c.is_closed()) {
            return Ok(conn.clone());
        }

        let conn = self.dial(address).await?;
        pool.insert(address.to_string(), conn.clone());
        Ok(conn)
    }

    #[instrument(skip(self))]
    async fn dial(&self, address: &str) -> InferenceResult<C::Connection> {
        let conn = self.connector.connect(address).await?;
        info!("dialed inference backend");
        Ok(conn)
    }

    /// 当前池中连接数
    /// Number of pooled connections
    pub async fn pooled(&self) -> usize {
        self.pool.read().await.len()
    }

    /// 关闭所有连接
    /// Drop every pooled connection
    pub async fn close(&self) {
        let mut pool = self.pool.write().await;
        let count = pool.len();
        pool.clear();
        info!(count, "inference connections closed");
    }
}

#[async_trait]
impl<C: InferenceConnector> InferenceService for InferenceGateway<C> {
    #[instrument(skip(self, request, cancel), fields(backend = %address, session_id = %request.session_id))]
    async fn stream(
        &self,
        address: &str,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<mpsc::Receiver<GeneratedToken>> {
        if address.is_empty() {
            return Err(InferenceError::EmptyAddress);
        }

        let conn = self.connection(address).await?;
        let mut frames = conn.open_stream(request).await?;
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("stream cancelled by caller");
                        break;
                    }
                    _ = tx.closed() => break,
                    next = frames.next() => next,
                };

                let (token, last) = match next {
                    None => break,
                    Some(Ok(chunk)) => {
                        let token = GeneratedToken::from(chunk);
                        let last = token.is_last || token.is_error();
                        (token, last)
                    }
                    Some(Err(e)) => {
                        error!("stream receive error: {e}");
                        (GeneratedToken::failure(e.to_string()), true)
                    }
                };

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = tx.send(token) => sent.is_ok(),
                };
                if !sent || last {
                    break;
                }
            }
        });

        Ok(rx)
    }
}
