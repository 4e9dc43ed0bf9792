//! The event bus external collaborator: publishes lock-state and
//! control-store-commit notifications. Subscribers get a bounded
//! per-subscription queue; publish is best-effort — a slow subscriber can
//! miss events (the follower poller in `module.rs` is the recovery
//! mechanism for missed commit notifications).

use async_trait::async_trait;
use piccolo_types::{CommitEvent, LockStateChanged};
use tokio::sync::broadcast;

/// Bounded queue depth for a single subscriber. `ControlStoreCommit` is the
/// topic that matters for the dedup/ordering guarantee, tested elsewhere
/// with a queue of capacity 1.
const DEFAULT_CAPACITY: usize = 64;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_lock_state(&self, event: LockStateChanged);
    async fn publish_commit(&self, event: CommitEvent);
    fn subscribe_lock_state(&self) -> broadcast::Receiver<LockStateChanged>;
    fn subscribe_commit(&self) -> broadcast::Receiver<CommitEvent>;
}

/// In-process event bus backed by `tokio::sync::broadcast`. Stands in for
/// whatever inter-process or inter-service bus the full daemon runs in
/// production; the core only depends on the `EventBus` trait.
pub struct InMemoryBus {
    lock_state_tx: broadcast::Sender<LockStateChanged>,
    commit_tx: broadcast::Sender<CommitEvent>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (lock_state_tx, _) = broadcast::channel(capacity.max(1));
        let (commit_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            lock_state_tx,
            commit_tx,
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish_lock_state(&self, event: LockStateChanged) {
        // Best-effort: an error here only means nobody is currently
        // subscribed, which is not a failure for the publisher.
        let _ = self.lock_state_tx.send(event);
    }

    async fn publish_commit(&self, event: CommitEvent) {
        let _ = self.commit_tx.send(event);
    }

    fn subscribe_lock_state(&self) -> broadcast::Receiver<LockStateChanged> {
        self.lock_state_tx.subscribe()
    }

    fn subscribe_commit(&self) -> broadcast::Receiver<CommitEvent> {
        self.commit_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piccolo_types::Role;

    #[tokio::test]
    async fn subscriber_observes_published_commit() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe_commit();
        bus.publish_commit(CommitEvent {
            revision: 1,
            checksum: "abc".into(),
            role: Role::Leader,
        })
        .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.revision, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = InMemoryBus::new();
        bus.publish_lock_state(LockStateChanged { locked: true }).await;
    }
}
