use crate::config::ConsulConfig;
use crate::error::GatewayError;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Consul /v1/health/service response: the Service structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(
        rename = "Meta",
        default,
        deserialize_with = "deserialize_null_default"
    )]
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "Status")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulNode {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// A single entry from the /v1/health/service response.
#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
    #[serde(rename = "Checks", default)]
    checks: Vec<ConsulCheck>,
}

/// Exposed service node information.
#[derive(Debug, Clone)]
pub struct ConsulServiceNode {
    pub service_id: String,
    pub service_address: String,
    pub service_port: u16,
    pub service_meta: HashMap<String, String>,
}

impl ConsulHealthEntry {
    /// A service registered without an address inherits its node's address.
    fn into_node(self) -> ConsulServiceNode {
        let service_address = if !self.service.address.is_empty() {
            self.service.address
        } else if !self.node.address.is_empty() {
            self.node.address
        } else {
            "127.0.0.1".to_string()
        };
        ConsulServiceNode {
            service_id: self.service.id,
            service_address,
            service_port: self.service.port,
            service_meta: self.service.meta,
        }
    }
}

/// Read-only Consul HTTP client: catalog listing and health queries.
#[derive(Clone)]
pub struct ConsulClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    pub fn new(
        consul_addr: &str,
        token: Option<String>,
        datacenter: Option<String>,
    ) -> Result<Self, GatewayError> {
        let base_url = if consul_addr.starts_with("http://") || consul_addr.starts_with("https://")
        {
            consul_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", consul_addr.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(GatewayError::Http)?;

        Ok(Self {
            base_url,
            client,
            token,
            datacenter,
        })
    }

    pub fn from_config(cfg: &ConsulConfig) -> Result<Self, GatewayError> {
        Self::new(&cfg.address, cfg.token.clone(), cfg.datacenter.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Inject the Consul ACL token into a request builder if configured.
    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    fn with_dc(&self, mut url: String) -> String {
        if let Some(dc) = &self.datacenter {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str("dc=");
            url.push_str(dc);
        }
        url
    }

    /// Names of every service in the catalog, excluding Consul itself.
    pub async fn list_services(&self) -> Result<BTreeSet<String>, GatewayError> {
        let url = self.with_dc(format!("{}/v1/catalog/services", self.base_url));

        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(GatewayError::Http)?;

        if !resp.status().is_success() {
            return Err(GatewayError::Consul(format!(
                "catalog non-200 response: status={}",
                resp.status()
            )));
        }

        let catalog: HashMap<String, Vec<String>> =
            resp.json().await.map_err(GatewayError::Http)?;
        Ok(catalog
            .into_keys()
            .filter(|name| name != "consul")
            .collect())
    }

    /// Query all healthy instances of a service.
    /// Uses `?passing=true` and additionally filters out nodes with critical serfHealth.
    pub async fn query_healthy_services(
        &self,
        service_name: &str,
    ) -> Result<Vec<ConsulServiceNode>, GatewayError> {
        let url = self.with_dc(format!(
            "{}/v1/health/service/{}?passing=true",
            self.base_url, service_name
        ));

        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(GatewayError::Http)?;

        if !resp.status().is_success() {
            return Err(GatewayError::Consul(format!(
                "non-200 response: status={}",
                resp.status()
            )));
        }

        let entries: Vec<ConsulHealthEntry> = resp.json().await.map_err(GatewayError::Http)?;

        let nodes: Vec<ConsulServiceNode> = entries
            .into_iter()
            .filter(|entry| {
                let has_critical_serf = entry.checks.iter().any(|check| {
                    check.check_id == "serfHealth" && check.status == "critical"
                });
                if has_critical_serf {
                    tracing::warn!(
                        "discovery: consul: skipping node with critical serfHealth, node={}, service={}",
                        entry.node.node,
                        service_name
                    );
                    false
                } else {
                    true
                }
            })
            .map(ConsulHealthEntry::into_node)
            .collect();

        Ok(nodes)
    }
}
