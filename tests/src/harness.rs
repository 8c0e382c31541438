//! In-process wiring of the full chat path
//!
//! Cache and relational tiers are [`InMemoryStore`]s behind [`FlakyStore`]
//! wrappers, discovery is static, load is tracked by a [`RecordingTracker`],
//! and inference goes through the real gateway to a [`ScriptedConnector`].

use crate::balancer::RecordingTracker;
use crate::inference::ScriptedConnector;
use crate::store::FlakyStore;
use palaver_foundation::background::BackgroundTasks;
use palaver_foundation::balancer::ModelLoadBalancer;
use palaver_foundation::discovery::StaticDiscovery;
use palaver_foundation::inference::InferenceGateway;
use palaver_foundation::orchestrator::{ChatOrchestrator, ChatSettings};
use palaver_foundation::persistence::InMemoryStore;
use palaver_foundation::repository::ConversationRepository;
use palaver_kernel::balancer::ServiceInstance;
use palaver_kernel::chat::{ChatEvent, ChatRequest};
use palaver_kernel::error::ChatResult;
use palaver_kernel::queue::DynEventPublisher;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct HarnessBuilder {
    services: HashMap<String, Vec<ServiceInstance>>,
    publisher: Option<DynEventPublisher>,
    settings: ChatSettings,
    connector: ScriptedConnector,
}

impl HarnessBuilder {
    /// Register one backend instance for `model`.
    pub fn backend(mut self, model: &str, address: &str, port: u16) -> Self {
        self.services
            .entry(model.to_string())
            .or_default()
            .push(ServiceInstance::new(address, port));
        self
    }

    /// Route writes through a durability queue instead of writing through.
    pub fn publisher(mut self, publisher: DynEventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn connector(mut self, connector: ScriptedConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn build(self) -> TestHarness {
        let cache_data = InMemoryStore::shared();
        let store_data = InMemoryStore::shared();
        let cache = Arc::new(FlakyStore::new(cache_data.clone()));
        let store = Arc::new(FlakyStore::new(store_data.clone()));

        let tasks = BackgroundTasks::new(self.settings.background_concurrency);
        let mut repo = ConversationRepository::new(cache.clone(), store.clone(), tasks.clone())
            .with_title_chars(self.settings.session_title_chars);
        if let Some(publisher) = self.publisher {
            repo = repo.with_publisher(publisher);
        }

        let tracker = Arc::new(RecordingTracker::new());
        let balancer = ModelLoadBalancer::new(
            Arc::new(StaticDiscovery::new(self.services)),
            tracker.clone(),
        );
        let gateway = Arc::new(InferenceGateway::new(self.connector.clone()));

        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::new(repo),
            balancer.clone(),
            gateway.clone(),
            tasks,
            self.settings,
        ));

        TestHarness {
            orchestrator,
            balancer,
            cache,
            cache_data,
            store,
            store_data,
            tracker,
            connector: self.connector,
            gateway,
        }
    }
}

pub struct TestHarness {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub balancer: ModelLoadBalancer,
    /// Cache tier as the repository sees it.
    pub cache: Arc<FlakyStore>,
    pub cache_data: Arc<InMemoryStore>,
    /// Relational tier as the repository sees it.
    pub store: Arc<FlakyStore>,
    pub store_data: Arc<InMemoryStore>,
    pub tracker: Arc<RecordingTracker>,
    pub connector: ScriptedConnector,
    pub gateway: Arc<InferenceGateway<ScriptedConnector>>,
}

impl TestHarness {
    /// No backends registered, replies "Hi there" once some are.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            services: HashMap::new(),
            publisher: None,
            settings: ChatSettings::default(),
            connector: ScriptedConnector::replying(&["Hi", " there"]),
        }
    }

    pub fn repository(&self) -> &ConversationRepository {
        self.orchestrator.repository()
    }

    /// Start a turn and hand back the raw event channel.
    pub async fn start(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        message: &str,
        model: &str,
        cancel: CancellationToken,
    ) -> ChatResult<mpsc::Receiver<ChatEvent>> {
        let request = ChatRequest::new(user_id, session_id.map(str::to_string), message, model);
        self.orchestrator.stream_chat(request, cancel).await
    }

    /// Run one turn to completion and collect every event.
    pub async fn chat(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        message: &str,
        model: &str,
    ) -> ChatResult<Vec<ChatEvent>> {
        let mut rx = self
            .start(user_id, session_id, message, model, CancellationToken::new())
            .await?;
        Ok(collect(&mut rx).await)
    }

    /// Wait for detached work (load release, assistant save, cache refill).
    pub async fn settle(&self) {
        self.orchestrator.background().wait_idle().await;
    }
}

/// Drain a stream until the orchestrator closes it.
pub async fn collect(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Concatenated content of a collected stream.
pub fn transcript(events: &[ChatEvent]) -> String {
    events.iter().map(|e| e.content.as_str()).collect()
}
