//! Builds the component graph from configuration.

use crate::config::{AppConfig, DatabaseConfig, DiscoveryBackend};
use anyhow::{Context, bail};
use palaver_foundation::background::BackgroundTasks;
use palaver_foundation::balancer::{InMemoryLoadTracker, ModelLoadBalancer, RedisLoadTracker};
use palaver_foundation::cache::{InProcessCache, RedisCache};
use palaver_foundation::discovery::{ConsulDiscovery, StaticDiscovery};
use palaver_foundation::inference::{GrpcConnector, InferenceGateway};
use palaver_foundation::metrics::ChatMetrics;
use palaver_foundation::orchestrator::ChatOrchestrator;
use palaver_foundation::persistence::{InMemoryStore, PostgresStore, SqliteStore};
use palaver_foundation::queue::{
    InMemoryQueue, PersistenceConsumer, QueueBackend, RedisStreamConsumer, RedisStreamPublisher,
};
use palaver_foundation::repository::ConversationRepository;
use palaver_kernel::balancer::{DynLoadTracker, DynServiceDiscovery};
use palaver_kernel::queue::{DynEventPublisher, EventHandler};
use palaver_kernel::store::DynConversationStore;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the running server owns.
pub struct Components {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub metrics: Arc<ChatMetrics>,
    gateway: Arc<InferenceGateway<GrpcConnector>>,
    consumer_cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

impl Components {
    /// Stop streams and background jobs, then the queue consumer, then
    /// drop pooled inference connections.
    pub async fn shutdown(self, timeout: Duration) {
        if !self.orchestrator.shutdown(timeout).await {
            warn!("background jobs did not finish before the shutdown timeout");
        }

        self.consumer_cancel.cancel();
        if let Some(handle) = self.consumer {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("persistence consumer did not stop before the shutdown timeout");
            }
        }

        self.gateway.close().await;
    }
}

async fn open_store(config: &DatabaseConfig) -> anyhow::Result<DynConversationStore> {
    let Some(url) = config.url.as_deref() else {
        warn!("no database configured, conversations are kept in memory");
        return Ok(InMemoryStore::shared());
    };

    if url.starts_with("sqlite:") {
        let store = SqliteStore::connect_with_options(url, config.max_connections)
            .await
            .context("connect sqlite")?;
        info!("using sqlite store");
        return Ok(Arc::new(store));
    }

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresStore::connect_with_options(url, config.max_connections)
            .await
            .context("connect postgres")?;
        store.run_migrations().await.context("create postgres schema")?;
        info!("using postgres store");
        return Ok(Arc::new(store));
    }

    bail!("unsupported database url scheme: {url}")
}

/// One shared multiplexed connection for request-path commands, plus the
/// client to open connections that may block.
struct RedisHandles {
    client: redis::Client,
    shared: ConnectionManager,
}

impl RedisHandles {
    /// A connection of its own, for `XREADGROUP BLOCK` and the like.
    async fn dedicated(&self) -> anyhow::Result<ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .context("open dedicated redis connection")
    }
}

async fn open_redis(url: Option<&str>) -> anyhow::Result<Option<RedisHandles>> {
    let Some(url) = url else {
        return Ok(None);
    };
    let client = redis::Client::open(url).context("parse redis url")?;
    let shared = client
        .get_connection_manager()
        .await
        .context("connect redis")?;
    info!("connected to redis");
    Ok(Some(RedisHandles { client, shared }))
}

/// A redis queue needs redis; without it the in-process queue keeps writes
/// asynchronous.
fn effective_queue_backend(configured: QueueBackend, has_redis: bool) -> QueueBackend {
    match configured {
        QueueBackend::Redis if !has_redis => {
            warn!("queue backend `redis` has no redis.url, using the in-process queue");
            QueueBackend::Memory
        }
        other => other,
    }
}

pub async fn build(config: &AppConfig) -> anyhow::Result<Components> {
    let metrics = Arc::new(ChatMetrics::new().context("register metrics")?);
    let redis = open_redis(config.redis.url.as_deref()).await?;
    let store = open_store(&config.database).await?;

    let cache: DynConversationStore = match &redis {
        Some(redis) => Arc::new(RedisCache::from_manager(redis.shared.clone(), config.redis.ttl)),
        None => {
            warn!("no redis configured, using an in-process cache");
            Arc::new(InProcessCache::new(config.redis.ttl))
        }
    };

    let tasks = BackgroundTasks::new(config.chat.background_concurrency);
    let mut repo = ConversationRepository::new(cache, store.clone(), tasks.clone())
        .with_metrics(metrics.clone())
        .with_title_chars(config.chat.session_title_chars);

    let consumer_cancel = CancellationToken::new();
    let handler: Arc<dyn EventHandler> = Arc::new(PersistenceConsumer::new(store));
    let consumer = match (effective_queue_backend(config.queue.backend, redis.is_some()), &redis) {
        (QueueBackend::Redis, Some(redis)) => {
            let publisher: DynEventPublisher =
                Arc::new(RedisStreamPublisher::new(redis.shared.clone(), &config.queue));
            repo = repo.with_publisher(publisher);
            let consumer = RedisStreamConsumer::new(redis.dedicated().await?, config.queue.clone());
            consumer.ensure_group().await.context("create consumer group")?;
            Some(tokio::spawn(consumer.run(handler, consumer_cancel.clone())))
        }
        (QueueBackend::Redis | QueueBackend::Memory, _) => {
            let (publisher, worker) = InMemoryQueue::channel(config.queue.retry_delay);
            repo = repo.with_publisher(Arc::new(publisher));
            Some(tokio::spawn(worker.run(handler, consumer_cancel.clone())))
        }
        (QueueBackend::None, _) => {
            info!("no durability queue, writes go straight to the store");
            None
        }
    };

    let tracker: DynLoadTracker = match &redis {
        Some(redis) => Arc::new(RedisLoadTracker::new(redis.shared.clone())),
        None => Arc::new(InMemoryLoadTracker::new()),
    };
    let discovery: DynServiceDiscovery = match config.discovery.backend {
        DiscoveryBackend::Static => {
            Arc::new(StaticDiscovery::new(config.discovery.services.clone()))
        }
        DiscoveryBackend::Consul => Arc::new(
            ConsulDiscovery::new(
                config.discovery.consul_address.clone(),
                config.discovery.datacenter.clone(),
            )
            .context("build consul client")?,
        ),
    };
    let balancer = ModelLoadBalancer::new(discovery, tracker);

    let gateway = Arc::new(InferenceGateway::new(GrpcConnector::new(
        config.inference.clone(),
    )));
    let orchestrator = Arc::new(
        ChatOrchestrator::new(
            Arc::new(repo),
            balancer,
            gateway.clone(),
            tasks,
            config.chat.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    Ok(Components {
        orchestrator,
        metrics,
        gateway,
        consumer_cancel,
        consumer,
    })
}
