//! Remote service layer for Policy Sync
//!
//! Defines the interfaces of the policy, identity and role services the
//! reconciliation engine talks to, plus an in-memory backend used for
//! local runs and tests.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::RemoteError;
pub use memory::{CallCounts, InMemoryPolicyService, StoredPolicy};
pub use traits::{
    IdentityClient, ListFilter, PolicyClient, RecordStream, RoleClient, OWNER_ROLE,
};

/// Unified remote services trait
pub trait RemoteServices: PolicyClient + IdentityClient + RoleClient + Send + Sync {}

impl<T> RemoteServices for T where T: PolicyClient + IdentityClient + RoleClient + Send + Sync {}
