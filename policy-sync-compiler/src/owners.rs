//! Owner email resolution with per-resolver caching

use parking_lot::Mutex;
use policy_sync_remote::{IdentityClient, RemoteError};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{OwnerLookupFailure, OwnerResolutionError};

/// Outcome of resolving a list of owner emails
#[derive(Debug, Clone, Default)]
pub struct ResolvedOwners {
    /// Ids of every email that resolved, in input order
    pub ids: Vec<String>,
    /// Set when at least one email failed
    pub error: Option<OwnerResolutionError>,
}

/// Resolves owner emails to user ids.
///
/// Successful lookups are memoized for the lifetime of the resolver; a
/// failed lookup is retried the next time that email is requested.
pub struct OwnerResolver {
    identity: Arc<dyn IdentityClient>,
    cache: Mutex<HashMap<String, String>>,
}

impl OwnerResolver {
    pub fn new(identity: Arc<dyn IdentityClient>) -> Self {
        Self {
            identity,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve every email, continuing past failures
    pub async fn resolve(&self, emails: &[String]) -> ResolvedOwners {
        let mut ids = Vec::with_capacity(emails.len());
        let mut failures = Vec::new();

        for email in emails {
            let cached = self.cache.lock().get(email).cloned();
            if let Some(id) = cached {
                ids.push(id);
                continue;
            }

            match self.identity.user_id_by_email(email).await {
                Ok(id) => {
                    self.cache.lock().insert(email.clone(), id.clone());
                    ids.push(id);
                }
                Err(source) => failures.push(OwnerLookupFailure {
                    email: email.clone(),
                    source,
                }),
            }
        }

        ResolvedOwners {
            ids,
            error: (!failures.is_empty()).then(|| OwnerResolutionError(failures)),
        }
    }

    /// Id of the identity the remote calls are made with. Never cached.
    pub async fn current_caller(&self) -> Result<String, RemoteError> {
        self.identity.current_user_id().await
    }

    /// Number of memoized emails
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_sync_remote::InMemoryPolicyService;

    fn emails(list: &[&str]) -> Vec<String> {
        list.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolve_caches_lookups() {
        let service = Arc::new(
            InMemoryPolicyService::new()
                .with_user("a@x.io", "u1")
                .with_user("b@x.io", "u2"),
        );
        let resolver = OwnerResolver::new(service.clone());

        let first = resolver.resolve(&emails(&["a@x.io", "b@x.io"])).await;
        let second = resolver.resolve(&emails(&["b@x.io", "a@x.io"])).await;

        assert_eq!(first.ids, vec!["u1", "u2"]);
        assert_eq!(second.ids, vec!["u2", "u1"]);
        assert!(first.error.is_none());
        assert_eq!(service.calls().lookup, 2);
        assert_eq!(resolver.cached(), 2);
    }

    #[tokio::test]
    async fn test_resolve_continues_past_failures() {
        let service = Arc::new(
            InMemoryPolicyService::new()
                .with_user("a@x.io", "u1")
                .with_user("c@x.io", "u3"),
        );
        service.fail_lookup("b@x.io");
        let resolver = OwnerResolver::new(service.clone());

        let resolved = resolver
            .resolve(&emails(&["a@x.io", "b@x.io", "c@x.io", "missing@x.io"]))
            .await;

        assert_eq!(resolved.ids, vec!["u1", "u3"]);
        let error = resolved.error.expect("expected a combined error");
        assert_eq!(error.emails(), vec!["b@x.io", "missing@x.io"]);
        assert!(error.to_string().contains("b@x.io"));
        assert!(error.to_string().contains("missing@x.io"));
    }

    #[tokio::test]
    async fn test_failed_lookup_is_not_cached() {
        let service = Arc::new(InMemoryPolicyService::new());
        let resolver = OwnerResolver::new(service.clone());

        resolver.resolve(&emails(&["a@x.io"])).await;
        resolver.resolve(&emails(&["a@x.io"])).await;

        assert_eq!(service.calls().lookup, 2);
        assert_eq!(resolver.cached(), 0);
    }

    #[tokio::test]
    async fn test_current_caller_is_not_cached() {
        let service = Arc::new(InMemoryPolicyService::new().with_current_user("me"));
        let resolver = OwnerResolver::new(service.clone());

        assert_eq!(resolver.current_caller().await.unwrap(), "me");
        assert_eq!(resolver.current_caller().await.unwrap(), "me");
        assert_eq!(service.calls().current_user, 2);
    }
}
