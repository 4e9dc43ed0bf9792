//! The cluster leadership registry external collaborator. Tracks the
//! current role for a named resource and republishes `RoleChanged` events
//! on the `leadership_role_changed` topic, consumed only (never published
//! to) by the core.

use async_trait::async_trait;
use piccolo_types::{Role, RoleChanged};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

#[async_trait]
pub trait LeadershipRegistry: Send + Sync {
    async fn role(&self, resource: &str) -> Role;
    fn subscribe_role_changed(&self) -> broadcast::Receiver<RoleChanged>;
}

/// Single-node-aware in-memory leadership registry. Real clusters delegate
/// this to whatever consensus layer elects leaders; the core only depends
/// on the trait.
pub struct InMemoryLeadership {
    roles: RwLock<HashMap<String, Role>>,
    tx: broadcast::Sender<RoleChanged>,
}

impl InMemoryLeadership {
    pub fn new(default_role: Role) -> Self {
        let (tx, _) = broadcast::channel(32);
        let mut roles = HashMap::new();
        roles.insert(piccolo_types::KERNEL_RESOURCE.to_string(), default_role);
        Self {
            roles: RwLock::new(roles),
            tx,
        }
    }

    /// Change the recorded role for `resource` and publish `RoleChanged`.
    pub async fn set_role(&self, resource: &str, role: Role) {
        self.roles.write().await.insert(resource.to_string(), role);
        let _ = self.tx.send(RoleChanged {
            resource: resource.to_string(),
            role,
        });
    }
}

#[async_trait]
impl LeadershipRegistry for InMemoryLeadership {
    async fn role(&self, resource: &str) -> Role {
        self.roles
            .read()
            .await
            .get(resource)
            .copied()
            .unwrap_or(Role::Follower)
    }

    fn subscribe_role_changed(&self) -> broadcast::Receiver<RoleChanged> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_role_is_honored() {
        let registry = InMemoryLeadership::new(Role::Leader);
        assert_eq!(registry.role(piccolo_types::KERNEL_RESOURCE).await, Role::Leader);
    }

    #[tokio::test]
    async fn set_role_publishes_change() {
        let registry = InMemoryLeadership::new(Role::Follower);
        let mut rx = registry.subscribe_role_changed();
        registry.set_role(piccolo_types::KERNEL_RESOURCE, Role::Leader).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.role, Role::Leader);
        assert_eq!(registry.role(piccolo_types::KERNEL_RESOURCE).await, Role::Leader);
    }

    #[tokio::test]
    async fn unknown_resource_defaults_to_follower() {
        let registry = InMemoryLeadership::new(Role::Leader);
        assert_eq!(registry.role("unknown").await, Role::Follower);
    }
}
