//! Per-core flow scheduler.
//!
//! Each core owns an independent, mutex-protected ordered set of flows that
//! have ungranted bytes but could not be granted. Flows are ranked by
//! remaining ungranted bytes, ties broken by arrival. The scheduler stores
//! only [`FlowId`]s; callers resolve them through their own registry, so a
//! torn-down connection is never reachable from here.
//!
//! Every flow carries an `in_pq` flag that is only written while the owning
//! core's lock is held. Removal therefore happens exactly once even when
//! teardown races replenishment.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::{FlowId, lock};

#[derive(Debug, Default)]
struct FlowQueue {
    order: BTreeSet<(usize, u64, FlowId)>,
    members: HashMap<FlowId, ((usize, u64), Arc<AtomicBool>)>,
    next_ticket: u64,
}

impl FlowQueue {
    fn take(&mut self, flow: FlowId) -> bool {
        match self.members.remove(&flow) {
            Some(((remaining, ticket), in_pq)) => {
                self.order.remove(&(remaining, ticket, flow));
                in_pq.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Scheduler entries for every core.
#[derive(Debug)]
pub struct CoreScheduler {
    cores: Vec<Mutex<FlowQueue>>,
    next_core: AtomicUsize,
}

impl CoreScheduler {
    /// Create one entry per core.
    pub fn new(cores: usize) -> Self {
        Self {
            cores: (0..cores.max(1)).map(|_| Mutex::default()).collect(),
            next_core: AtomicUsize::new(0),
        }
    }

    /// Number of cores.
    pub fn cores(&self) -> usize {
        self.cores.len()
    }

    /// Pick the core for a new connection, round-robin.
    pub fn assign_core(&self) -> usize {
        self.next_core.fetch_add(1, Ordering::Relaxed) % self.cores.len()
    }

    /// Queue `flow` on `core`; returns `false` if it was already queued.
    pub fn insert(&self, core: usize, flow: FlowId, remaining: usize, in_pq: &Arc<AtomicBool>) -> bool {
        let mut queue = lock(&self.cores[core]);
        if queue.members.contains_key(&flow) {
            return false;
        }
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.order.insert((remaining, ticket, flow));
        queue.members.insert(flow, ((remaining, ticket), Arc::clone(in_pq)));
        in_pq.store(true, Ordering::Release);
        true
    }

    /// Remove `flow` from `core`; returns `true` for the one caller that did.
    pub fn remove(&self, core: usize, flow: FlowId) -> bool {
        lock(&self.cores[core]).take(flow)
    }

    /// Pop the flow with the fewest remaining bytes.
    pub fn pop(&self, core: usize) -> Option<FlowId> {
        let mut queue = lock(&self.cores[core]);
        let &(_, _, flow) = queue.order.first()?;
        queue.take(flow);
        Some(flow)
    }

    /// Pop every flow queued on `core`, best first.
    pub fn drain(&self, core: usize) -> Vec<FlowId> {
        let mut queue = lock(&self.cores[core]);
        let flows: Vec<FlowId> = queue.order.iter().map(|&(_, _, flow)| flow).collect();
        for flow in &flows {
            queue.take(*flow);
        }
        flows
    }

    /// Flows queued on `core`.
    pub fn len(&self, core: usize) -> usize {
        lock(&self.cores[core]).members.len()
    }

    /// Whether no core has a queued flow.
    pub fn is_empty(&self) -> bool {
        self.cores.iter().all(|core| lock(core).members.is_empty())
    }
}
