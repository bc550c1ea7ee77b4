//! Leader RPC: length-prefixed JSON frames over TCP.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::*;
pub use protocol::*;
pub use server::*;

use async_trait::async_trait;
use std::sync::Arc;

use crate::lease::{LeaseManager, RangeGrant, Submission};
use crate::stopset::StopSet;

/// The two operations a monitor needs from the leader
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn acquire_range(&self, agent_id: &str) -> Result<RangeGrant, RpcError>;

    async fn submit_results(&self, submission: Submission) -> Result<(), RpcError>;
}

/// In-process leader, used by `trace` runs and tests
#[async_trait]
impl<S: StopSet> LeaseClient for Arc<LeaseManager<S>> {
    async fn acquire_range(&self, agent_id: &str) -> Result<RangeGrant, RpcError> {
        Ok(LeaseManager::acquire_range(self, agent_id)?)
    }

    async fn submit_results(&self, submission: Submission) -> Result<(), RpcError> {
        Ok(LeaseManager::submit_results(self, &submission)?)
    }
}
