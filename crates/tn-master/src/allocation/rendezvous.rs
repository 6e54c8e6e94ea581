//! Address exchange between the containers of a multi-container task.

use std::collections::HashMap;
use tokio::sync::oneshot;

use tn_types::{AllocationError, AllocationId, ReservationId};

use crate::rm::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousInfo {
    /// Addresses of every container, indexed by rank.
    pub addresses: Vec<Vec<Address>>,
    pub rank: usize,
}

#[derive(Debug)]
pub struct RendezvousWatcher {
    rx: oneshot::Receiver<RendezvousInfo>,
}

impl RendezvousWatcher {
    /// Waits until every container has checked in; `None` if the allocation
    /// ended first.
    pub async fn wait(self) -> Option<RendezvousInfo> {
        self.rx.await.ok()
    }

    pub fn try_info(&mut self) -> Option<RendezvousInfo> {
        self.rx.try_recv().ok()
    }
}

/// Rendezvous is ready once every reservation has reported Running with its
/// addresses and every reservation's runner is watching. Readiness is latched.
#[derive(Debug)]
pub struct Rendezvous {
    allocation_id: AllocationId,
    ranks: Vec<ReservationId>,
    addresses: HashMap<ReservationId, Vec<Address>>,
    watchers: HashMap<ReservationId, oneshot::Sender<RendezvousInfo>>,
    ready: bool,
    timer_armed: bool,
}

impl Rendezvous {
    pub fn new(allocation_id: AllocationId, ranks: Vec<ReservationId>) -> Self {
        Self {
            allocation_id,
            ranks,
            addresses: HashMap::new(),
            watchers: HashMap::new(),
            ready: false,
            timer_armed: false,
        }
    }

    fn rank_of(&self, id: &ReservationId) -> Option<usize> {
        self.ranks.iter().position(|r| r == id)
    }

    fn info(&self, rank: usize) -> RendezvousInfo {
        RendezvousInfo {
            addresses: self
                .ranks
                .iter()
                .map(|id| self.addresses.get(id).cloned().unwrap_or_default())
                .collect(),
            rank,
        }
    }

    pub fn watch(&mut self, id: &ReservationId) -> Result<RendezvousWatcher, AllocationError> {
        let rank = self
            .rank_of(id)
            .ok_or_else(|| AllocationError::UnknownReservation(id.clone()))?;
        let (tx, rx) = oneshot::channel();
        if self.ready {
            let _ = tx.send(self.info(rank));
        } else {
            self.watchers.insert(id.clone(), tx);
        }
        Ok(RendezvousWatcher { rx })
    }

    pub fn unwatch(&mut self, id: &ReservationId) {
        self.watchers.remove(id);
    }

    pub fn container_started(&mut self, id: &ReservationId, addresses: Vec<Address>) {
        if self.rank_of(id).is_some() {
            self.addresses.insert(id.clone(), addresses);
        }
    }

    /// Releases the watchers if everyone has checked in. True only on the
    /// call that makes the rendezvous ready.
    pub fn try_ready(&mut self) -> bool {
        if self.ready {
            return false;
        }
        let all_in = self
            .ranks
            .iter()
            .all(|id| self.addresses.contains_key(id) && self.watchers.contains_key(id));
        if !all_in {
            return false;
        }
        self.ready = true;
        for (id, tx) in std::mem::take(&mut self.watchers) {
            if let Some(rank) = self.rank_of(&id) {
                let _ = tx.send(self.info(rank));
            }
        }
        true
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// True the first time; the caller schedules the timeout.
    pub fn arm_timer(&mut self) -> bool {
        !std::mem::replace(&mut self.timer_armed, true)
    }

    /// Operator-facing explanation of what is still missing.
    pub fn timeout_message(&self) -> Option<String> {
        if self.ready {
            return None;
        }
        let waiting: Vec<String> = self
            .ranks
            .iter()
            .filter(|id| !self.addresses.contains_key(id) || !self.watchers.contains_key(id))
            .map(|id| id.to_string())
            .collect();
        Some(format!(
            "some containers of allocation {} are taking a long time to connect: waiting on {}",
            self.allocation_id,
            waiting.join(", ")
        ))
    }
}
