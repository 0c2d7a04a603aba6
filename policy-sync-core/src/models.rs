//! Core domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Prefix of the source tag attached to every managed policy
pub const SOURCE_PREFIX: &str = "dbt";

/// Reason recorded on every lock this system places
pub const LOCK_REASON: &str = "locked by dbt";

/// Build the source tag for a project, e.g. `dbt-jaffle_shop`
pub fn source_tag(project_name: &str) -> String {
    format!("{}-{}", SOURCE_PREFIX, project_name)
}

/// Normalize a fully-qualified name prefix so it can be joined directly
/// with `database.schema.name`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        prefix.to_string()
    } else {
        format!("{}.", prefix)
    }
}

/// The three kinds of data-access policy this system manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Grant,
    Filter,
    Mask,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Grant => "grant",
            PolicyKind::Filter => "filter",
            PolicyKind::Mask => "mask",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grant" => Ok(PolicyKind::Grant),
            "filter" | "filtered" => Ok(PolicyKind::Filter),
            "mask" => Ok(PolicyKind::Mask),
            other => Err(CoreError::UnknownPolicyKind(other.to_string())),
        }
    }
}

/// A data object a policy applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetObject {
    /// Fully-qualified name of the table, view or snapshot
    pub fullname: String,
    /// Column within the object (masks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub global_permissions: Vec<String>,
}

impl TargetObject {
    pub fn object(fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
            column: None,
            permissions: Vec::new(),
            global_permissions: Vec::new(),
        }
    }

    pub fn column(fullname: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            column: Some(column.into()),
            ..Self::object(fullname)
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>, global_permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self.global_permissions = global_permissions;
        self
    }

    /// Name of the target as the remote service knows it; columns are
    /// addressed as `object.column`.
    pub fn qualified_name(&self) -> String {
        match &self.column {
            Some(column) => format!("{}.{}", self.fullname, column),
            None => self.fullname.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Target objects may only change through this system
    What,
    /// The policy name may only change through this system
    Name,
    /// Owners may only change through this system
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLock {
    pub kind: LockKind,
    pub reason: String,
}

impl PolicyLock {
    pub fn new(kind: LockKind) -> Self {
        Self {
            kind,
            reason: LOCK_REASON.to_string(),
        }
    }
}

/// Desired state of one policy, derived from the manifest.
///
/// Drafts are values: every change goes through a consuming `with_*` step
/// that returns the rebuilt draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub kind: PolicyKind,
    /// Unique within its kind
    pub name: String,
    pub data_source: String,
    /// Source tag, see [`source_tag`]
    pub source: String,
    pub target_objects: Vec<TargetObject>,
    /// Predicate expression (filters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_rule: Option<String>,
    /// Masking algorithm (masks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_type: Option<String>,
    /// Resolved user ids
    #[serde(default)]
    pub owners: BTreeSet<String>,
    pub locks: Vec<PolicyLock>,
}

impl PolicyDraft {
    fn new(kind: PolicyKind, name: String, data_source: String, source: String) -> Self {
        Self {
            kind,
            name,
            data_source,
            source,
            target_objects: Vec::new(),
            policy_rule: None,
            mask_type: None,
            owners: BTreeSet::new(),
            locks: vec![PolicyLock::new(LockKind::What), PolicyLock::new(LockKind::Name)],
        }
    }

    pub fn grant(name: impl Into<String>, data_source: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(PolicyKind::Grant, name.into(), data_source.into(), source.into())
    }

    pub fn filter(
        name: impl Into<String>,
        data_source: impl Into<String>,
        source: impl Into<String>,
        policy_rule: impl Into<String>,
    ) -> Self {
        Self {
            policy_rule: Some(policy_rule.into()),
            ..Self::new(PolicyKind::Filter, name.into(), data_source.into(), source.into())
        }
    }

    pub fn mask(
        name: impl Into<String>,
        data_source: impl Into<String>,
        source: impl Into<String>,
        mask_type: Option<String>,
    ) -> Self {
        Self {
            mask_type,
            ..Self::new(PolicyKind::Mask, name.into(), data_source.into(), source.into())
        }
    }

    pub fn with_target(mut self, target: TargetObject) -> Self {
        self.target_objects.push(target);
        self
    }

    /// Merge owner ids into the draft. The owner lock is attached the first
    /// time the owner set becomes non-empty.
    pub fn with_owners<I>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.owners.extend(owners);
        if !self.owners.is_empty() && !self.has_lock(LockKind::Owner) {
            self.locks.push(PolicyLock::new(LockKind::Owner));
        }
        self
    }

    pub fn has_lock(&self, kind: LockKind) -> bool {
        self.locks.iter().any(|l| l.kind == kind)
    }

    /// Distinct base objects referenced by the targets, in first-seen order
    pub fn base_objects(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for target in &self.target_objects {
            if !seen.contains(&target.fullname.as_str()) {
                seen.push(&target.fullname);
            }
        }
        seen
    }
}

pub type DraftMap = BTreeMap<String, PolicyDraft>;

/// The desired state for one run: drafts per kind plus the source tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftSets {
    pub source: String,
    pub grants: DraftMap,
    pub filters: DraftMap,
    pub masks: DraftMap,
}

impl DraftSets {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn by_kind(&self, kind: PolicyKind) -> &DraftMap {
        match kind {
            PolicyKind::Grant => &self.grants,
            PolicyKind::Filter => &self.filters,
            PolicyKind::Mask => &self.masks,
        }
    }

    pub fn len(&self) -> usize {
        self.grants.len() + self.filters.len() + self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A policy instance as held by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub name: String,
    /// Raw kind as reported by the remote service; may name kinds this
    /// system does not manage.
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: PolicyKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.as_str().to_string(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The managed kind of this record, `None` for foreign kinds
    pub fn policy_kind(&self) -> Option<PolicyKind> {
        self.kind.parse().ok()
    }
}

/// Existing ids per kind and the ids to delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub grant_ids: HashMap<String, String>,
    pub filter_ids: HashMap<String, String>,
    pub mask_ids: HashMap<String, String>,
    pub ids_to_remove: BTreeSet<String>,
}

impl ReconciliationPlan {
    pub fn ids(&self, kind: PolicyKind) -> &HashMap<String, String> {
        match kind {
            PolicyKind::Grant => &self.grant_ids,
            PolicyKind::Filter => &self.filter_ids,
            PolicyKind::Mask => &self.mask_ids,
        }
    }

    pub fn ids_mut(&mut self, kind: PolicyKind) -> &mut HashMap<String, String> {
        match kind {
            PolicyKind::Grant => &mut self.grant_ids,
            PolicyKind::Filter => &mut self.filter_ids,
            PolicyKind::Mask => &mut self.mask_ids,
        }
    }

    pub fn existing_id(&self, kind: PolicyKind, name: &str) -> Option<&str> {
        self.ids(kind).get(name).map(String::as_str)
    }

    /// Number of apply units this plan produces for the given drafts
    pub fn unit_count(&self, drafts: &DraftSets) -> usize {
        drafts.len() + self.ids_to_remove.len()
    }
}

/// Result of one apply unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Created,
    Updated,
    Deleted,
    Failed,
}

/// Aggregated outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyTotals {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub failed: u32,
}

impl ApplyTotals {
    pub fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Failed => self.failed += 1,
        }
    }

    pub fn successful(&self) -> u32 {
        self.created + self.updated + self.deleted
    }

    pub fn total(&self) -> u32 {
        self.successful() + self.failed
    }
}

/// Summary of a completed reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub totals: ApplyTotals,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn new(totals: ApplyTotals, started_at: DateTime<Utc>) -> Self {
        Self {
            totals,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("prefix"), "prefix.");
        assert_eq!(normalize_prefix("prefix."), "prefix.");
    }

    #[test]
    fn test_owner_lock_added_once() {
        let draft = PolicyDraft::grant("g1", "ds", "dbt-p")
            .with_owners(vec!["u1".to_string()])
            .with_owners(vec!["u2".to_string()]);

        assert_eq!(draft.owners.len(), 2);
        assert_eq!(draft.locks.iter().filter(|l| l.kind == LockKind::Owner).count(), 1);
    }

    #[test]
    fn test_no_owner_lock_without_owners() {
        let draft = PolicyDraft::grant("g1", "ds", "dbt-p").with_owners(Vec::new());
        assert!(!draft.has_lock(LockKind::Owner));
        assert!(draft.has_lock(LockKind::What));
        assert!(draft.has_lock(LockKind::Name));
    }

    #[test]
    fn test_remote_record_kind() {
        let record = RemoteRecord {
            id: "p1".to_string(),
            name: "purpose".to_string(),
            kind: "purpose".to_string(),
            source: None,
        };
        assert_eq!(record.policy_kind(), None);
        assert_eq!(
            RemoteRecord::new("f1", "f", PolicyKind::Filter).policy_kind(),
            Some(PolicyKind::Filter)
        );
    }

    #[test]
    fn test_column_target_qualified_name() {
        let target = TargetObject::column("db.schema.customers", "email");
        assert_eq!(target.qualified_name(), "db.schema.customers.email");
    }

    #[test]
    fn test_totals() {
        let mut totals = ApplyTotals::default();
        totals.record(ApplyOutcome::Created);
        totals.record(ApplyOutcome::Failed);
        totals.record(ApplyOutcome::Deleted);
        assert_eq!(totals.successful(), 2);
        assert_eq!(totals.total(), 3);
    }
}
