//! 服务发现
//! Service discovery
//!
//! - [`StaticDiscovery`]: fixed instance table from configuration
//! - [`ConsulDiscovery`]: Consul health API, passing instances only

use async_trait::async_trait;
use palaver_kernel::balancer::{BalancerError, BalancerResult, ServiceDiscovery, ServiceInstance};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// 静态实例表
/// Static instance table
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<ServiceInstance>>,
}

impl StaticDiscovery {
    pub fn new(services: HashMap<String, Vec<ServiceInstance>>) -> Self {
        Self { services }
    }

    /// 注册一个服务的实例列表
    /// Add (or replace) a service's instance list
    pub fn with_service(
        mut self,
        name: impl Into<String>,
        instances: Vec<ServiceInstance>,
    ) -> Self {
        self.services.insert(name.into(), instances);
        self
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, service_name: &str) -> BalancerResult<Vec<ServiceInstance>> {
        Ok(self.services.get(service_name).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

impl From<HealthEntry> for ServiceInstance {
    fn from(entry: HealthEntry) -> Self {
        let address = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };
        ServiceInstance::new(address, entry.service.port)
    }
}

/// Consul 健康实例发现
/// Consul health-based discovery
pub struct ConsulDiscovery {
    client: reqwest::Client,
    base_url: String,
    datacenter: Option<String>,
}

impl ConsulDiscovery {
    pub fn new(base_url: impl Into<String>, datacenter: Option<String>) -> BalancerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BalancerError::Discovery(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            datacenter,
        })
    }

    fn health_url(&self, service_name: &str) -> String {
        format!("{}/v1/health/service/{}", self.base_url, service_name)
    }
}

#[async_trait]
impl ServiceDiscovery for ConsulDiscovery {
    #[instrument(skip(self))]
    async fn discover(&self, service_name: &str) -> BalancerResult<Vec<ServiceInstance>> {
        let mut request = self
            .client
            .get(self.health_url(service_name))
            .query(&[("passing", "true")]);
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BalancerError::Discovery(format!("failed to discover service {service_name}: {e}")))?
            .error_for_status()
            .map_err(|e| BalancerError::Discovery(format!("failed to discover service {service_name}: {e}")))?;

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| BalancerError::Discovery(e.to_string()))?;

        let instances: Vec<ServiceInstance> = entries.into_iter().map(Into::into).collect();
        debug!(service = service_name, count = instances.len(), "discovered instances");
        Ok(instances)
    }
}
