//! Quota hook supplied by the billing collaborator

use async_trait::async_trait;

/// Consulted before an agent or tunnel is created; `false` yields `QuotaExceeded`
#[async_trait]
pub trait QuotaChecker: Send + Sync {
    async fn can_create_agent(&self, owner_id: &str) -> bool;

    async fn can_create_tunnel(&self, owner_id: &str) -> bool;
}

/// Allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaChecker for UnlimitedQuota {
    async fn can_create_agent(&self, _owner_id: &str) -> bool {
        true
    }

    async fn can_create_tunnel(&self, _owner_id: &str) -> bool {
        true
    }
}
