//! Traits defining the remote collaborators

use async_trait::async_trait;
use policy_sync_core::{PolicyDraft, RemoteRecord};
use std::pin::Pin;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::RemoteError;

/// Role identifier used when assigning policy owners
pub const OWNER_ROLE: &str = "OwnerRole";

/// Lazy listing of remote policies; every element succeeds or fails on its own
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<RemoteRecord, RemoteError>> + Send + 'static>>;

/// Filter applied to a policy listing
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only return policies carrying this source tag
    pub source: Option<String>,
}

impl ListFilter {
    pub fn by_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
        }
    }
}

/// Trait for policy service operations
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Create a policy and return its newly assigned id
    async fn create_policy(&self, draft: &PolicyDraft) -> Result<String, RemoteError>;

    /// Replace the content of an existing policy
    async fn update_policy(
        &self,
        id: &str,
        draft: &PolicyDraft,
        override_locks: bool,
    ) -> Result<(), RemoteError>;

    /// Delete a policy
    async fn delete_policy(&self, id: &str, override_locks: bool) -> Result<(), RemoteError>;

    /// Stream existing policies. The listing stops producing records once
    /// `cancel` fires.
    fn list_policies(&self, filter: ListFilter, cancel: CancellationToken) -> RecordStream;
}

/// Trait for identity lookups
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Resolve an email address to a user id
    async fn user_id_by_email(&self, email: &str) -> Result<String, RemoteError>;

    /// User id of the identity the calls are made with
    async fn current_user_id(&self) -> Result<String, RemoteError>;
}

/// Trait for role assignment on policies
#[async_trait]
pub trait RoleClient: Send + Sync {
    /// Bind users to a role on a policy, replacing previous assignees
    async fn assign_role(
        &self,
        policy_id: &str,
        role_id: &str,
        user_ids: &[String],
    ) -> Result<(), RemoteError>;
}
