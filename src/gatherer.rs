//! Parallel collection of observed server list and LB node list for a
//! group. See spec.md §4.2.

use crate::cloud_gateway::CloudGateway;
use crate::error::GatherError;
use crate::model::{GroupId, LbId, ObservedFleet};
use std::sync::Arc;
use std::time::Duration;

pub struct Gatherer<G: CloudGateway> {
    gateway: Arc<G>,
    max_attempts: u32,
}

impl<G: CloudGateway> Gatherer<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Gatherer { gateway, max_attempts: 3 }
    }

    /// Issues the compute list and per-LB node list requests concurrently,
    /// filters servers by metadata group_id match, and returns a snapshot.
    /// A hard failure (transient errors exhausted) aborts the cycle.
    pub async fn gather(&self, group_id: &GroupId, lb_ids: &[LbId]) -> Result<ObservedFleet, GatherError> {
        let servers_fut = self.list_servers_with_retry(group_id);
        let lb_futs = lb_ids.iter().map(|lb_id| self.list_lb_nodes_with_retry(lb_id));

        let (servers_result, lb_results) = futures::future::join(servers_fut, futures::future::join_all(lb_futs)).await;

        let servers = servers_result?;
        let mut lb_nodes = Vec::new();
        for result in lb_results {
            lb_nodes.extend(result?);
        }

        let servers = servers.into_iter().filter(|s| s.owned_by(group_id)).collect();

        Ok(ObservedFleet { servers, lb_nodes })
    }

    async fn list_servers_with_retry(&self, group_id: &GroupId) -> Result<Vec<crate::model::Server>, GatherError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.list_servers(group_id).await {
                Ok(servers) => return Ok(servers),
                Err(e) if e.retryable && attempt < self.max_attempts => {
                    tokio::time::sleep(exponential_backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(GatherError::Servers { group_id: group_id.clone(), source: e }),
            }
        }
    }

    async fn list_lb_nodes_with_retry(&self, lb_id: &LbId) -> Result<Vec<crate::model::LbNode>, GatherError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.list_lb_nodes(lb_id).await {
                Ok(nodes) => return Ok(nodes),
                Err(e) if e.retryable && attempt < self.max_attempts => {
                    tokio::time::sleep(exponential_backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(GatherError::LbNodes { lb_id: lb_id.clone(), source: e }),
            }
        }
    }
}

fn exponential_backoff(attempt: u32) -> Duration {
    Duration::from_millis(250) * 2u32.pow(attempt.saturating_sub(1))
}
