//! In-memory remote backend for local runs and testing

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use policy_sync_core::{PolicyDraft, RemoteRecord};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    IdentityClient, ListFilter, PolicyClient, RecordStream, RemoteError, RoleClient,
};

/// A policy as stored by the in-memory backend
#[derive(Debug, Clone)]
pub struct StoredPolicy {
    pub record: RemoteRecord,
    /// Last content written through this backend, `None` for seeded records
    pub draft: Option<PolicyDraft>,
    pub locked: bool,
}

/// Number of calls received per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub list: usize,
    pub lookup: usize,
    pub current_user: usize,
    pub assign: usize,
}

impl CallCounts {
    /// Calls that mutate policies
    pub fn mutations(&self) -> usize {
        self.create + self.update + self.delete
    }
}

#[derive(Debug, Default)]
struct Failures {
    /// Policy names
    create: HashSet<String>,
    /// Policy names
    update: HashSet<String>,
    /// Policy ids
    delete: HashSet<String>,
    /// Policy names
    assign: HashSet<String>,
    /// Emails
    lookup: HashSet<String>,
    current_user: bool,
    listing_after: Option<usize>,
}

/// In-memory policy, identity and role service.
///
/// Listing returns policies in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryPolicyService {
    policies: RwLock<Vec<StoredPolicy>>,
    users: RwLock<HashMap<String, String>>,
    current_user: RwLock<Option<String>>,
    assignments: RwLock<HashMap<String, (String, BTreeSet<String>)>>,
    failures: RwLock<Failures>,
    calls: Mutex<CallCounts>,
    latency: RwLock<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryPolicyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user that can be resolved by email
    pub fn with_user(self, email: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.users.write().insert(email.into(), user_id.into());
        self
    }

    /// Set the identity the calls are made with
    pub fn with_current_user(self, user_id: impl Into<String>) -> Self {
        *self.current_user.write() = Some(user_id.into());
        self
    }

    /// Delay every mutating call, to make concurrent units overlap
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    /// Seed an existing remote record (unlocked, no content)
    pub fn insert_record(&self, record: RemoteRecord) {
        self.policies.write().push(StoredPolicy {
            record,
            draft: None,
            locked: false,
        });
    }

    pub fn fail_create(&self, name: impl Into<String>) {
        self.failures.write().create.insert(name.into());
    }

    pub fn fail_update(&self, name: impl Into<String>) {
        self.failures.write().update.insert(name.into());
    }

    pub fn fail_delete(&self, id: impl Into<String>) {
        self.failures.write().delete.insert(id.into());
    }

    pub fn fail_role_assignment(&self, policy_name: impl Into<String>) {
        self.failures.write().assign.insert(policy_name.into());
    }

    pub fn fail_lookup(&self, email: impl Into<String>) {
        self.failures.write().lookup.insert(email.into());
    }

    pub fn fail_current_user(&self) {
        self.failures.write().current_user = true;
    }

    /// Make the listing yield an error after `count` records
    pub fn fail_listing_after(&self, count: usize) {
        self.failures.write().listing_after = Some(count);
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    /// Highest number of mutating calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn policies(&self) -> Vec<StoredPolicy> {
        self.policies.read().clone()
    }

    pub fn policy(&self, id: &str) -> Option<StoredPolicy> {
        self.policies.read().iter().find(|p| p.record.id == id).cloned()
    }

    pub fn policy_by_name(&self, name: &str) -> Option<StoredPolicy> {
        self.policies.read().iter().find(|p| p.record.name == name).cloned()
    }

    /// Users assigned to `role_id` on a policy
    pub fn assignees(&self, policy_id: &str, role_id: &str) -> Option<BTreeSet<String>> {
        self.assignments
            .read()
            .get(policy_id)
            .filter(|(role, _)| role == role_id)
            .map(|(_, users)| users.clone())
    }

    async fn enter_call(&self) -> InFlightGuard<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        InFlightGuard {
            counter: &self.in_flight,
        }
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PolicyClient for InMemoryPolicyService {
    async fn create_policy(&self, draft: &PolicyDraft) -> Result<String, RemoteError> {
        self.calls.lock().create += 1;
        let _guard = self.enter_call().await;

        if self.failures.read().create.contains(&draft.name) {
            return Err(RemoteError::Rejected(format!("create of '{}' refused", draft.name)));
        }

        let id = Uuid::new_v4().to_string();
        let record = RemoteRecord::new(id.clone(), draft.name.clone(), draft.kind)
            .with_source(draft.source.clone());

        self.policies.write().push(StoredPolicy {
            record,
            draft: Some(draft.clone()),
            locked: !draft.locks.is_empty(),
        });

        Ok(id)
    }

    async fn update_policy(
        &self,
        id: &str,
        draft: &PolicyDraft,
        override_locks: bool,
    ) -> Result<(), RemoteError> {
        self.calls.lock().update += 1;
        let _guard = self.enter_call().await;

        if self.failures.read().update.contains(&draft.name) {
            return Err(RemoteError::Rejected(format!("update of '{}' refused", draft.name)));
        }

        let mut policies = self.policies.write();
        let stored = policies
            .iter_mut()
            .find(|p| p.record.id == id)
            .ok_or_else(|| RemoteError::NotFound(format!("Policy with id {} not found", id)))?;

        if stored.locked && !override_locks {
            return Err(RemoteError::Locked(format!("Policy with id {} is locked", id)));
        }

        stored.record.name = draft.name.clone();
        stored.record.source = Some(draft.source.clone());
        stored.draft = Some(draft.clone());
        stored.locked = !draft.locks.is_empty();
        Ok(())
    }

    async fn delete_policy(&self, id: &str, override_locks: bool) -> Result<(), RemoteError> {
        self.calls.lock().delete += 1;
        let _guard = self.enter_call().await;

        if self.failures.read().delete.contains(id) {
            return Err(RemoteError::Rejected(format!("delete of {} refused", id)));
        }

        let mut policies = self.policies.write();
        let index = policies
            .iter()
            .position(|p| p.record.id == id)
            .ok_or_else(|| RemoteError::NotFound(format!("Policy with id {} not found", id)))?;

        if policies[index].locked && !override_locks {
            return Err(RemoteError::Locked(format!("Policy with id {} is locked", id)));
        }

        policies.remove(index);
        self.assignments.write().remove(id);
        Ok(())
    }

    fn list_policies(&self, filter: ListFilter, cancel: CancellationToken) -> RecordStream {
        self.calls.lock().list += 1;

        let records: Vec<RemoteRecord> = self
            .policies
            .read()
            .iter()
            .filter(|p| match &filter.source {
                Some(source) => p.record.source.as_deref() == Some(source.as_str()),
                None => true,
            })
            .map(|p| p.record.clone())
            .collect();
        let fail_after = self.failures.read().listing_after;

        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut items: Vec<Result<RemoteRecord, RemoteError>> =
                records.into_iter().map(Ok).collect();
            if let Some(count) = fail_after {
                items.truncate(count);
                items.push(Err(RemoteError::Connection("listing interrupted".to_string())));
            }

            for item in items {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("Policy listing cancelled");
                        break;
                    }
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl IdentityClient for InMemoryPolicyService {
    async fn user_id_by_email(&self, email: &str) -> Result<String, RemoteError> {
        self.calls.lock().lookup += 1;

        if self.failures.read().lookup.contains(email) {
            return Err(RemoteError::Connection(format!("lookup of {} failed", email)));
        }

        self.users
            .read()
            .get(email)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("User with email {} not found", email)))
    }

    async fn current_user_id(&self) -> Result<String, RemoteError> {
        self.calls.lock().current_user += 1;

        if self.failures.read().current_user {
            return Err(RemoteError::Connection("current user lookup failed".to_string()));
        }

        self.current_user
            .read()
            .clone()
            .ok_or_else(|| RemoteError::NotFound("No current user".to_string()))
    }
}

#[async_trait]
impl RoleClient for InMemoryPolicyService {
    async fn assign_role(
        &self,
        policy_id: &str,
        role_id: &str,
        user_ids: &[String],
    ) -> Result<(), RemoteError> {
        self.calls.lock().assign += 1;

        let name = self
            .policy(policy_id)
            .map(|p| p.record.name)
            .ok_or_else(|| RemoteError::NotFound(format!("Policy with id {} not found", policy_id)))?;

        if self.failures.read().assign.contains(&name) {
            return Err(RemoteError::Rejected(format!(
                "role assignment on '{}' refused",
                name
            )));
        }

        self.assignments.write().insert(
            policy_id.to_string(),
            (role_id.to_string(), user_ids.iter().cloned().collect()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_sync_core::PolicyKind;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_create_and_list_policy() {
        let service = InMemoryPolicyService::new();
        let draft = PolicyDraft::grant("readers", "ds1", "dbt-shop");

        let id = service.create_policy(&draft).await.unwrap();

        let listed: Vec<_> = service
            .list_policies(ListFilter::by_source("dbt-shop"), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(listed.len(), 1);
        let record = listed[0].as_ref().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.policy_kind(), Some(PolicyKind::Grant));
    }

    #[tokio::test]
    async fn test_listing_filters_by_source() {
        let service = InMemoryPolicyService::new();
        service.insert_record(RemoteRecord::new("a", "a", PolicyKind::Grant).with_source("dbt-shop"));
        service.insert_record(RemoteRecord::new("b", "b", PolicyKind::Grant).with_source("dbt-other"));

        let listed: Vec<_> = service
            .list_policies(ListFilter::by_source("dbt-shop"), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_listing_stops_when_cancelled() {
        let service = InMemoryPolicyService::new();
        service.insert_record(RemoteRecord::new("a", "a", PolicyKind::Grant));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let listed: Vec<_> = service.list_policies(ListFilter::default(), cancel).collect().await;
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_injection() {
        let service = InMemoryPolicyService::new();
        service.insert_record(RemoteRecord::new("a", "a", PolicyKind::Grant));
        service.insert_record(RemoteRecord::new("b", "b", PolicyKind::Grant));
        service.fail_listing_after(1);

        let listed: Vec<_> = service
            .list_policies(ListFilter::default(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_ok());
        assert!(listed[1].is_err());
    }

    #[tokio::test]
    async fn test_locked_policy_requires_override() {
        let service = InMemoryPolicyService::new();
        let draft = PolicyDraft::grant("readers", "ds1", "dbt-shop");
        let id = service.create_policy(&draft).await.unwrap();

        let result = service.delete_policy(&id, false).await;
        assert!(matches!(result, Err(RemoteError::Locked(_))));

        service.delete_policy(&id, true).await.unwrap();
        assert!(service.policy(&id).is_none());
    }

    #[tokio::test]
    async fn test_role_assignment() {
        let service = InMemoryPolicyService::new();
        let id = service
            .create_policy(&PolicyDraft::grant("readers", "ds1", "dbt-shop"))
            .await
            .unwrap();

        service
            .assign_role(&id, crate::OWNER_ROLE, &["u1".to_string()])
            .await
            .unwrap();

        let owners = service.assignees(&id, crate::OWNER_ROLE).unwrap();
        assert!(owners.contains("u1"));
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let service = InMemoryPolicyService::new().with_user("a@x.io", "u1");
        assert_eq!(service.user_id_by_email("a@x.io").await.unwrap(), "u1");
        assert!(matches!(
            service.user_id_by_email("b@x.io").await,
            Err(RemoteError::NotFound(_))
        ));
    }
}
