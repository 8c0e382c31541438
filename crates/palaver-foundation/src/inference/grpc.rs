//! gRPC 推理传输
//! gRPC inference transport
//!
//! Service `llm_inference.InferencerService`, bidirectional method
//! `StreamInference`. Message types are declared by hand with prost derives.

use super::InferenceSettings;
use async_trait::async_trait;
use futures::StreamExt;
use palaver_kernel::inference::{
    ChunkStream, InferenceChunk, InferenceConnection, InferenceConnector, InferenceError,
    InferenceRequest, InferenceResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

/// Wire messages of the inference protocol.
pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferenceRequest {
        #[prost(string, tag = "1")]
        pub session_id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferenceResponse {
        #[prost(string, tag = "1")]
        pub chunk: ::prost::alloc::string::String,
        #[prost(bool, tag = "2")]
        pub is_finished: bool,
        #[prost(string, tag = "3")]
        pub error: ::prost::alloc::string::String,
        #[prost(int32, tag = "4")]
        pub generated_tokens: i32,
    }

    pub const STREAM_INFERENCE_PATH: &str = "/llm_inference.InferencerService/StreamInference";
    pub const TRACE_ID_HEADER: &str = "x-trace-id";
}

impl From<InferenceRequest> for pb::InferenceRequest {
    fn from(req: InferenceRequest) -> Self {
        Self {
            session_id: req.session_id,
            message: req.message,
        }
    }
}

impl From<pb::InferenceResponse> for InferenceChunk {
    fn from(resp: pb::InferenceResponse) -> Self {
        Self {
            chunk: resp.chunk,
            is_finished: resp.is_finished,
            error: resp.error,
            generated_tokens: resp.generated_tokens,
        }
    }
}

/// 建立 gRPC 连接
/// Dials gRPC channels
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    settings: InferenceSettings,
}

impl GrpcConnector {
    pub fn new(settings: InferenceSettings) -> Self {
        Self { settings }
    }

    fn endpoint(&self, address: &str) -> InferenceResult<Endpoint> {
        let endpoint = Endpoint::from_shared(format!("http://{address}")).map_err(|e| {
            InferenceError::Dial {
                address: address.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(endpoint
            .connect_timeout(self.settings.connect_timeout)
            .http2_keep_alive_interval(self.settings.keepalive_interval)
            .keep_alive_timeout(self.settings.keepalive_timeout)
            .keep_alive_while_idle(true))
    }
}

#[async_trait]
impl InferenceConnector for GrpcConnector {
    type Connection = GrpcConnection;

    async fn connect(&self, address: &str) -> InferenceResult<GrpcConnection> {
        let channel = self
            .endpoint(address)?
            .connect()
            .await
            .map_err(|e| InferenceError::Dial {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        Ok(GrpcConnection {
            channel,
            closed: Arc::new(AtomicBool::new(false)),
            last_used: Arc::new(Mutex::new(Instant::now())),
            idle_timeout: self.settings.idle_timeout,
        })
    }
}

/// 池化的 gRPC 连接
/// Pooled gRPC connection
///
/// 传输层失败后标记为关闭；空闲超过 `idle_timeout` 也视为关闭，下次使用时重连。
/// Marked closed after a transport-level failure. A connection idle for
/// longer than `idle_timeout` also reports closed and is redialed.
#[derive(Clone)]
pub struct GrpcConnection {
    channel: Channel,
    closed: Arc<AtomicBool>,
    last_used: Arc<Mutex<Instant>>,
    idle_timeout: Duration,
}

impl GrpcConnection {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn is_transport_failure(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::Unavailable
}

#[async_trait]
impl InferenceConnection for GrpcConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.last_used.lock().elapsed() > self.idle_timeout
    }

    async fn open_stream(&self, request: InferenceRequest) -> InferenceResult<ChunkStream> {
        *self.last_used.lock() = Instant::now();

        let trace_id = MetadataValue::try_from(request.session_id.as_str())
            .map_err(|e| InferenceError::StreamSetup(e.to_string()))?;

        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client.ready().await.map_err(|e| {
            self.mark_closed();
            InferenceError::StreamSetup(e.to_string())
        })?;

        let outbound = futures::stream::iter([pb::InferenceRequest::from(request)]);
        let mut call = tonic::Request::new(outbound);
        call.metadata_mut().insert(pb::TRACE_ID_HEADER, trace_id);

        let codec = ProstCodec::<pb::InferenceRequest, pb::InferenceResponse>::default();
        let path = PathAndQuery::from_static(pb::STREAM_INFERENCE_PATH);
        let response = client.streaming(call, path, codec).await.map_err(|status| {
            if is_transport_failure(&status) {
                self.mark_closed();
            }
            InferenceError::StreamSetup(status.to_string())
        })?;

        let closed = self.closed.clone();
        let inbound = response.into_inner().map(move |frame| {
            frame.map(InferenceChunk::from).map_err(|status| {
                if is_transport_failure(&status) {
                    warn!("inference transport failed mid-stream, connection will be redialed");
                    closed.store(true, Ordering::SeqCst);
                }
                InferenceError::Receive(status.message().to_string())
            })
        });
        Ok(inbound.boxed())
    }
}
