//! Reconciliation orchestration
//!
//! One run builds the drafts from the manifest, classifies the remote
//! policies of the same source, then applies the resulting plan.

use chrono::Utc;
use policy_sync_compiler::{OwnerResolver, PolicyDraftBuilder};
use policy_sync_core::{
    ApplyOutcome, DraftSets, FileManifestSource, ManifestDocument, ManifestSource, PolicyDraft,
    ReconciliationPlan, SyncReport,
};
use policy_sync_remote::{IdentityClient, PolicyClient, RemoteServices, RoleClient, OWNER_ROLE};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{ApplyEngine, ApplyError, ApplyReport, ApplyUnit, RemoteStateClassifier, SyncError, DEFAULT_MAX_WORKERS};

/// Reconciliation settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Data source every draft targets
    pub data_source_id: String,
    /// Apply-engine concurrency bound
    pub max_workers: usize,
    /// Assign the calling identity as owner of drafts without owners
    pub default_owner_to_caller: bool,
}

impl ReconcilerConfig {
    pub fn new(data_source_id: impl Into<String>) -> Self {
        Self {
            data_source_id: data_source_id.into(),
            ..Self::default()
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            data_source_id: String::new(),
            max_workers: DEFAULT_MAX_WORKERS,
            default_owner_to_caller: true,
        }
    }
}

/// Drives a full reconciliation of a manifest against the remote policies
pub struct ReconciliationEngine {
    policies: Arc<dyn PolicyClient>,
    identity: Arc<dyn IdentityClient>,
    roles: Arc<dyn RoleClient>,
    manifests: Arc<dyn ManifestSource>,
    classifier: RemoteStateClassifier,
    engine: ApplyEngine,
    config: ReconcilerConfig,
}

impl ReconciliationEngine {
    pub fn new<S>(config: ReconcilerConfig, services: Arc<S>) -> Self
    where
        S: RemoteServices + 'static,
    {
        let policies: Arc<dyn PolicyClient> = services.clone();
        let identity: Arc<dyn IdentityClient> = services.clone();
        let roles: Arc<dyn RoleClient> = services;

        Self {
            classifier: RemoteStateClassifier::new(policies.clone()),
            engine: ApplyEngine::new(config.max_workers),
            manifests: Arc::new(FileManifestSource::new()),
            policies,
            identity,
            roles,
            config,
        }
    }

    /// Replace the manifest loader used by [`run_file`](Self::run_file)
    pub fn with_manifest_source(mut self, manifests: Arc<dyn ManifestSource>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Load the manifest at `path` and reconcile it
    pub async fn run_file(&self, path: &Path, prefix: &str) -> Result<SyncReport, SyncError> {
        let manifest = self.manifests.load(path)?;
        self.run(&manifest, prefix).await
    }

    /// Reconcile one manifest.
    ///
    /// Validation and listing failures abort before any policy is mutated.
    /// Apply failures are reported once every unit has finished, together
    /// with the counters reached.
    pub async fn run(&self, manifest: &ManifestDocument, prefix: &str) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();

        // Owner lookups are memoized for this run only.
        let owners = Arc::new(OwnerResolver::new(self.identity.clone()));
        let drafts = PolicyDraftBuilder::new(&self.config.data_source_id, owners.clone())
            .build(manifest, prefix)
            .await
            .into_result()?;

        tracing::info!(
            "Reconciling {} grants, {} filters and {} masks for source '{}'",
            drafts.grants.len(),
            drafts.filters.len(),
            drafts.masks.len(),
            drafts.source
        );

        let plan = {
            let cancel = CancellationToken::new();
            self.classifier
                .classify(&drafts, &cancel)
                .await
                .map_err(SyncError::Listing)?
        };

        let default_owner = if drafts.is_empty() {
            None
        } else {
            self.default_owner(&owners).await
        };
        let totals = self.apply(drafts, plan, default_owner).await.into_result()?;

        let report = SyncReport::new(totals, started_at);
        tracing::info!(
            "Reconciliation finished: {} added, {} updated, {} removed, {} failures",
            report.totals.created,
            report.totals.updated,
            report.totals.deleted,
            report.totals.failed
        );
        Ok(report)
    }

    /// Apply a plan: every draft is created or updated, every stale id is
    /// deleted. Units are submitted grants first, then filters, masks and
    /// removals.
    pub async fn apply(
        &self,
        drafts: DraftSets,
        plan: ReconciliationPlan,
        default_owner: Option<String>,
    ) -> ApplyReport {
        let mut units: Vec<ApplyUnit> = Vec::with_capacity(plan.unit_count(&drafts));

        let DraftSets {
            grants,
            filters,
            masks,
            ..
        } = drafts;

        for draft in grants.into_values().chain(filters.into_values()).chain(masks.into_values()) {
            let existing = plan.existing_id(draft.kind, &draft.name).map(str::to_string);
            units.push(Box::pin(create_or_update(
                self.policies.clone(),
                self.roles.clone(),
                draft,
                existing,
                default_owner.clone(),
            )));
        }

        for id in plan.ids_to_remove {
            units.push(Box::pin(delete(self.policies.clone(), id)));
        }

        self.engine.run(units).await
    }

    async fn default_owner(&self, owners: &OwnerResolver) -> Option<String> {
        if !self.config.default_owner_to_caller {
            return None;
        }

        match owners.current_caller().await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!("Could not resolve the calling identity, no default owner: {}", err);
                None
            }
        }
    }
}

async fn create_or_update(
    policies: Arc<dyn PolicyClient>,
    roles: Arc<dyn RoleClient>,
    draft: PolicyDraft,
    existing: Option<String>,
    default_owner: Option<String>,
) -> Result<ApplyOutcome, ApplyError> {
    // A defaulted owner is written and locked like a declared one.
    let draft = match default_owner {
        Some(owner) if draft.owners.is_empty() => draft.with_owners([owner]),
        _ => draft,
    };

    let (id, outcome) = match existing {
        Some(id) => {
            tracing::debug!("Updating {} '{}' ({})", draft.kind, draft.name, id);
            policies
                .update_policy(&id, &draft, true)
                .await
                .map_err(|source| ApplyError::Update {
                    kind: draft.kind,
                    name: draft.name.clone(),
                    id: id.clone(),
                    source,
                })?;
            (id, ApplyOutcome::Updated)
        }
        None => {
            tracing::debug!("Creating {} '{}'", draft.kind, draft.name);
            let id = policies
                .create_policy(&draft)
                .await
                .map_err(|source| ApplyError::Create {
                    kind: draft.kind,
                    name: draft.name.clone(),
                    source,
                })?;
            (id, ApplyOutcome::Created)
        }
    };

    let owners: Vec<String> = draft.owners.iter().cloned().collect();

    if !owners.is_empty() {
        tracing::debug!("Assigning {} owner(s) to {} '{}'", owners.len(), draft.kind, draft.name);
        // The policy itself is kept when this fails.
        roles
            .assign_role(&id, OWNER_ROLE, &owners)
            .await
            .map_err(|source| ApplyError::AssignOwners {
                kind: draft.kind,
                name: draft.name.clone(),
                id: id.clone(),
                source,
            })?;
    }

    Ok(outcome)
}

async fn delete(policies: Arc<dyn PolicyClient>, id: String) -> Result<ApplyOutcome, ApplyError> {
    tracing::debug!("Deleting policy {}", id);
    policies
        .delete_policy(&id, true)
        .await
        .map_err(|source| ApplyError::Delete { id: id.clone(), source })?;
    Ok(ApplyOutcome::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_sync_core::{ApplyTotals, LockKind, PolicyKind, RemoteRecord};
    use policy_sync_remote::InMemoryPolicyService;
    use rstest::rstest;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    const SOURCE: &str = "dbt-shop";

    fn manifest(nodes: serde_json::Value) -> ManifestDocument {
        serde_json::from_value(json!({
            "metadata": { "project_name": "shop" },
            "nodes": nodes
        }))
        .unwrap()
    }

    fn model(name: &str, raito: serde_json::Value) -> serde_json::Value {
        json!({
            "resource_type": "model",
            "database": "db",
            "schema": "sales",
            "name": name,
            "meta": { "raito": raito }
        })
    }

    fn grants(names: &[&str]) -> ManifestDocument {
        let directives: Vec<_> = names
            .iter()
            .map(|name| json!({ "name": name, "permissions": ["SELECT"] }))
            .collect();
        manifest(json!({ "model.shop.orders": model("orders", json!({ "grant": directives })) }))
    }

    fn engine(service: &Arc<InMemoryPolicyService>) -> ReconciliationEngine {
        ReconciliationEngine::new(ReconcilerConfig::new("ds1"), service.clone())
    }

    fn seed(service: &InMemoryPolicyService, id: &str, name: &str, kind: PolicyKind) {
        service.insert_record(RemoteRecord::new(id, name, kind).with_source(SOURCE));
    }

    #[tokio::test]
    async fn test_manifest_without_annotations_is_a_no_op() {
        let service = Arc::new(InMemoryPolicyService::new());
        let manifest = manifest(json!({ "model.shop.orders": model("orders", json!({})) }));

        let report = engine(&service).run(&manifest, "").await.unwrap();

        assert_eq!(report.totals, ApplyTotals::default());
        assert_eq!(service.calls().mutations(), 0);
        assert_eq!(service.calls().current_user, 0);
        assert!(report.completed_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_update_existing_and_remove_stale() {
        let service = Arc::new(InMemoryPolicyService::new());
        seed(&service, "r1", "g1", PolicyKind::Grant);
        seed(&service, "r2", "stale", PolicyKind::Grant);

        let report = engine(&service).run(&grants(&["g1"]), "").await.unwrap();

        assert_eq!(
            report.totals,
            ApplyTotals {
                created: 0,
                updated: 1,
                deleted: 1,
                failed: 0
            }
        );
        assert_eq!(service.calls().update, 1);
        assert_eq!(service.calls().delete, 1);
        assert!(service.policy("r2").is_none());

        let updated = service.policy("r1").unwrap().draft.unwrap();
        assert_eq!(updated.target_objects[0].fullname, "db.sales.orders");
        assert_eq!(updated.data_source, "ds1");
    }

    #[tokio::test]
    async fn test_validation_error_blocks_remote_calls() {
        let service = Arc::new(InMemoryPolicyService::new());
        seed(&service, "r1", "stale", PolicyKind::Grant);
        let manifest = manifest(json!({
            "model.shop.orders": model("orders", json!({ "filter": [{ "name": "f1", "policy_rule": "1 = 1" }] })),
            "model.shop.customers": model("customers", json!({ "filter": [{ "name": "f1", "policy_rule": "1 = 2" }] }))
        }));

        let result = engine(&service).run(&manifest, "").await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(service.calls().list, 0);
        assert_eq!(service.calls().mutations(), 0);
        assert!(service.policy("r1").is_some());
    }

    #[tokio::test]
    async fn test_listing_error_aborts_run() {
        let service = Arc::new(InMemoryPolicyService::new());
        seed(&service, "r1", "g1", PolicyKind::Grant);
        service.fail_listing_after(0);

        let err = engine(&service).run(&grants(&["g1", "g2"]), "").await.unwrap_err();

        assert!(matches!(err, SyncError::Listing(_)));
        assert_eq!(err.totals(), ApplyTotals::default());
        assert_eq!(service.calls().mutations(), 0);
    }

    #[tokio::test]
    async fn test_owner_assignment_failure_keeps_policy() {
        let service = Arc::new(InMemoryPolicyService::new().with_user("a@x.io", "u1"));
        service.fail_role_assignment("g1");
        let manifest = manifest(json!({
            "model.shop.orders": model("orders", json!({ "grant": [{ "name": "g1", "owners": ["a@x.io"] }] }))
        }));

        let err = engine(&service).run(&manifest, "").await.unwrap_err();

        assert_eq!(
            err.totals(),
            ApplyTotals {
                created: 0,
                updated: 0,
                deleted: 0,
                failed: 1
            }
        );
        match err {
            SyncError::Apply { errors, .. } => {
                assert!(matches!(errors.0[0], ApplyError::AssignOwners { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(service.policy_by_name("g1").is_some());
    }

    #[tokio::test]
    async fn test_update_failure_does_not_stop_siblings() {
        let service = Arc::new(InMemoryPolicyService::new());
        seed(&service, "r1", "g1", PolicyKind::Grant);
        seed(&service, "r2", "g2", PolicyKind::Grant);
        service.fail_update("g1");

        let err = engine(&service).run(&grants(&["g1", "g2", "g3"]), "").await.unwrap_err();

        assert_eq!(
            err.totals(),
            ApplyTotals {
                created: 1,
                updated: 1,
                deleted: 0,
                failed: 1
            }
        );
        match err {
            SyncError::Apply { errors, .. } => {
                assert_eq!(errors.0.len(), 1);
                assert!(matches!(
                    &errors.0[0],
                    ApplyError::Update { name, id, .. } if name == "g1" && id == "r1"
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(service.policy("r2").unwrap().draft.is_some());
        assert!(service.policy_by_name("g3").is_some());
    }

    #[tokio::test]
    async fn test_second_run_only_updates() {
        let service = Arc::new(InMemoryPolicyService::new());
        let engine = engine(&service);
        let manifest = grants(&["g1", "g2"]);

        let first = engine.run(&manifest, "").await.unwrap();
        let after_first = service.policies();
        let second = engine.run(&manifest, "").await.unwrap();

        assert_eq!(first.totals.created, 2);
        assert_eq!(
            second.totals,
            ApplyTotals {
                created: 0,
                updated: 2,
                deleted: 0,
                failed: 0
            }
        );
        let ids = |policies: Vec<policy_sync_remote::StoredPolicy>| {
            policies.into_iter().map(|p| (p.record.id, p.draft)).collect::<Vec<_>>()
        };
        assert_eq!(ids(after_first), ids(service.policies()));
    }

    #[tokio::test]
    async fn test_caller_is_default_owner() {
        let service = Arc::new(InMemoryPolicyService::new().with_current_user("me"));

        engine(&service).run(&grants(&["g1"]), "").await.unwrap();

        let stored = service.policy_by_name("g1").unwrap();
        let owners = service.assignees(&stored.record.id, OWNER_ROLE).unwrap();
        assert_eq!(owners.into_iter().collect::<Vec<_>>(), vec!["me"]);

        let draft = stored.draft.unwrap();
        assert!(draft.owners.contains("me"));
        assert!(draft.has_lock(LockKind::Owner));
    }

    #[tokio::test]
    async fn test_declared_owners_replace_default_owner() {
        let service = Arc::new(
            InMemoryPolicyService::new()
                .with_current_user("me")
                .with_user("a@x.io", "u1"),
        );
        let manifest = manifest(json!({
            "model.shop.orders": model("orders", json!({ "grant": [{ "name": "g1", "owners": ["a@x.io"] }] }))
        }));

        engine(&service).run(&manifest, "").await.unwrap();

        let id = service.policy_by_name("g1").unwrap().record.id;
        let owners = service.assignees(&id, OWNER_ROLE).unwrap();
        assert_eq!(owners.into_iter().collect::<Vec<_>>(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_unknown_caller_disables_default_owner() {
        let service = Arc::new(InMemoryPolicyService::new());
        service.fail_current_user();

        let report = engine(&service).run(&grants(&["g1"]), "").await.unwrap();

        assert_eq!(report.totals.created, 1);
        assert_eq!(service.calls().assign, 0);
    }

    #[tokio::test]
    async fn test_default_owner_can_be_disabled() {
        let service = Arc::new(InMemoryPolicyService::new().with_current_user("me"));
        let config = ReconcilerConfig {
            default_owner_to_caller: false,
            ..ReconcilerConfig::new("ds1")
        };

        ReconciliationEngine::new(config, service.clone())
            .run(&grants(&["g1"]), "")
            .await
            .unwrap();

        assert_eq!(service.calls().current_user, 0);
        assert_eq!(service.calls().assign, 0);
    }

    #[tokio::test]
    async fn test_counts_cover_every_unit() {
        let service = Arc::new(InMemoryPolicyService::new());
        seed(&service, "f-old", "f1", PolicyKind::Filter);
        seed(&service, "stale-1", "gone", PolicyKind::Mask);
        seed(&service, "stale-2", "g1", PolicyKind::Grant);
        seed(&service, "stale-3", "g1", PolicyKind::Grant);
        service.fail_create("g2");
        service.fail_delete("stale-3");
        let manifest = manifest(json!({
            "model.shop.orders": model("orders", json!({
                "grant": [{ "name": "g2" }, { "name": "g3" }],
                "filter": [{ "name": "f1", "policy_rule": "region = 'EU'" }]
            }))
        }));

        let err = engine(&service).run(&manifest, "").await.unwrap_err();

        // Three drafts plus three stale records
        let totals = err.totals();
        assert_eq!(totals.total(), 6);
        assert_eq!(
            totals,
            ApplyTotals {
                created: 1,
                updated: 1,
                deleted: 2,
                failed: 2
            }
        );
        assert_eq!(service.calls().mutations(), 6);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[tokio::test]
    async fn test_apply_respects_worker_limit(#[case] max_workers: usize) {
        let service = Arc::new(InMemoryPolicyService::new().with_latency(Duration::from_millis(5)));
        let names: Vec<String> = (0..10).map(|i| format!("g{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let config = ReconcilerConfig {
            max_workers,
            default_owner_to_caller: false,
            ..ReconcilerConfig::new("ds1")
        };

        let report = ReconciliationEngine::new(config, service.clone())
            .run(&grants(&names), "")
            .await
            .unwrap();

        assert_eq!(report.totals.created, 10);
        assert!(service.max_in_flight() <= max_workers);
    }

    #[tokio::test]
    async fn test_run_file_applies_prefix() {
        let service = Arc::new(InMemoryPolicyService::new());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&grants(&["g1"])).unwrap()).unwrap();

        let report = engine(&service).run_file(file.path(), "warehouse").await.unwrap();

        assert_eq!(report.totals.created, 1);
        let draft = service.policy_by_name("g1").unwrap().draft.unwrap();
        assert_eq!(draft.target_objects[0].fullname, "warehouse.db.sales.orders");
        assert_eq!(draft.source, SOURCE);
    }

    #[tokio::test]
    async fn test_run_file_missing_manifest() {
        let service = Arc::new(InMemoryPolicyService::new());

        let result = engine(&service)
            .run_file(Path::new("/nonexistent/manifest.json"), "")
            .await;

        assert!(matches!(result, Err(SyncError::Manifest(_))));
        assert_eq!(service.calls().list, 0);
    }
}
