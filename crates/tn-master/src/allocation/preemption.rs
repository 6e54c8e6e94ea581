//! Graceful-shutdown handshake between the master and a task's runners.

use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Resolves once the allocation has been asked to shut down.
#[derive(Debug)]
pub struct PreemptionWatcher {
    rx: oneshot::Receiver<()>,
}

impl PreemptionWatcher {
    /// Waits for the preemption signal. Returns false if the allocation went
    /// away without preempting.
    pub async fn wait(self) -> bool {
        self.rx.await.is_ok()
    }

    /// Non-blocking check.
    pub fn is_preempted(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[derive(Debug, Default)]
pub struct Preemption {
    preempted: bool,
    acknowledged: bool,
    watchers: HashMap<Uuid, oneshot::Sender<()>>,
}

impl Preemption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, id: Uuid) -> PreemptionWatcher {
        let (tx, rx) = oneshot::channel();
        if self.preempted {
            let _ = tx.send(());
        } else {
            self.watchers.insert(id, tx);
        }
        PreemptionWatcher { rx }
    }

    pub fn unwatch(&mut self, id: &Uuid) {
        self.watchers.remove(id);
    }

    /// Signals every watcher once. Returns true the first time only.
    pub fn preempt(&mut self) -> bool {
        if self.preempted {
            return false;
        }
        self.preempted = true;
        for (_, tx) in self.watchers.drain() {
            let _ = tx.send(());
        }
        true
    }

    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    pub fn is_preempted(&self) -> bool {
        self.preempted
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preempt_signals_current_watchers_once() {
        let mut preemption = Preemption::new();
        let mut first = preemption.watch(Uuid::new_v4());
        let mut second = preemption.watch(Uuid::new_v4());
        assert!(!first.is_preempted());

        assert!(preemption.preempt());
        assert!(!preemption.preempt());
        assert!(first.is_preempted());
        assert!(second.is_preempted());
    }

    #[test]
    fn late_watcher_is_signalled_immediately() {
        let mut preemption = Preemption::new();
        preemption.preempt();
        let mut late = preemption.watch(Uuid::new_v4());
        assert!(late.is_preempted());
    }

    #[tokio::test]
    async fn unwatched_watcher_sees_closed_channel() {
        let mut preemption = Preemption::new();
        let id = Uuid::new_v4();
        let watcher = preemption.watch(id);
        preemption.unwatch(&id);
        preemption.preempt();
        assert!(!watcher.wait().await);
    }

    #[test]
    fn acknowledge_is_recorded() {
        let mut preemption = Preemption::new();
        assert!(!preemption.is_acknowledged());
        preemption.acknowledge();
        assert!(preemption.is_acknowledged());
    }
}
