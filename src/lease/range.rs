use parking_lot::{Mutex, MutexGuard};
use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;

use crate::stopset::StopSet;

/// Mutable part of a range, guarded by the range's own lock
#[derive(Debug)]
pub struct RangeState<S> {
    /// Current lease holder; `None` means free
    pub lessee: Option<String>,
    /// Bumped on every grant so a stale reclaim timer cannot clear a newer lease
    pub generation: u64,
    /// Cancels the outstanding reclaim timer
    pub reclaim: Option<CancellationToken>,
    /// Forward/backward keys merged from every submission for this range
    pub stops: S,
}

impl<S> RangeState<S> {
    pub fn is_free(&self) -> bool {
        self.lessee.is_none()
    }

    pub fn is_held_by(&self, agent_id: &str) -> bool {
        self.lessee.as_deref() == Some(agent_id)
    }

    /// Clear the lease and stop its timer
    pub fn release(&mut self) -> Option<String> {
        if let Some(token) = self.reclaim.take() {
            token.cancel();
        }
        self.lessee.take()
    }
}

/// A fixed slice of the target list, leased to at most one agent at a time
#[derive(Debug)]
pub struct IpRange<S> {
    id: usize,
    addresses: Vec<Ipv4Addr>,
    state: Mutex<RangeState<S>>,
}

impl<S: StopSet> IpRange<S> {
    pub fn new(id: usize, addresses: Vec<Ipv4Addr>, stops: S) -> Self {
        Self {
            id,
            addresses,
            state: Mutex::new(RangeState {
                lessee: None,
                generation: 0,
                reclaim: None,
                stops,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    pub fn lock(&self) -> MutexGuard<'_, RangeState<S>> {
        self.state.lock()
    }

    pub fn lessee(&self) -> Option<String> {
        self.state.lock().lessee.clone()
    }
}
