// background module - bounded pool for fire-and-forget jobs
pub mod background;

// balancer module - per-model load accounting
pub mod balancer;

// cache module - Redis cache tier
pub mod cache;

// discovery module - static and Consul instance lookup
pub mod discovery;

pub mod duration_serde;

// inference module - pooled gRPC gateway to inference workers
pub mod inference;

// metrics module - Prometheus counters
pub mod metrics;

// orchestrator module - one streaming chat turn end to end
pub mod orchestrator;

// persistence module - relational stores
pub mod persistence;

// queue module - write-behind durability queue
pub mod queue;

// repository module - cache-aside composition of the two tiers
pub mod repository;

pub use background::BackgroundTasks;
pub use balancer::{InMemoryLoadTracker, ModelLoadBalancer, RedisLoadTracker};
pub use cache::{CacheTtl, InProcessCache, RedisCache};
pub use discovery::{ConsulDiscovery, StaticDiscovery};
pub use inference::{GrpcConnector, InferenceGateway, InferenceSettings};
pub use metrics::ChatMetrics;
pub use orchestrator::{ChatOrchestrator, ChatSettings};
pub use persistence::InMemoryStore;
pub use queue::{
    InMemoryQueue, PersistenceConsumer, QueueBackend, QueueSettings, RedisStreamConsumer,
    RedisStreamPublisher,
};
pub use repository::ConversationRepository;
