//! Policy draft builder
//!
//! Walks the supported resources of a manifest and collects the grant,
//! filter and mask directives into named drafts. Conflicts are collected
//! rather than returned on first sight, so one pass reports all of them.

use policy_sync_core::manifest::{FilterDirective, GrantDirective, ManifestResource, MaskDirective};
use policy_sync_core::{
    normalize_prefix, source_tag, DraftMap, DraftSets, ManifestDocument, PolicyDraft, PolicyKind,
    TargetObject,
};
use std::sync::Arc;

use crate::{OwnerResolver, ValidationError, ValidationErrors};

/// Drafts produced by one build, together with every conflict found
#[derive(Debug, Clone, Default)]
pub struct DraftBuild {
    pub sets: DraftSets,
    pub errors: Vec<ValidationError>,
}

impl DraftBuild {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Drafts of `kind`, or `None` when a conflict affected that kind
    pub fn usable(&self, kind: PolicyKind) -> Option<&DraftMap> {
        if self.errors.iter().any(|e| e.kind() == kind) {
            None
        } else {
            Some(self.sets.by_kind(kind))
        }
    }

    pub fn into_result(self) -> Result<DraftSets, ValidationErrors> {
        if self.errors.is_empty() {
            Ok(self.sets)
        } else {
            Err(ValidationErrors(self.errors))
        }
    }
}

/// Builds policy drafts from manifest annotations
pub struct PolicyDraftBuilder {
    data_source: String,
    owners: Arc<OwnerResolver>,
}

impl PolicyDraftBuilder {
    pub fn new(data_source: impl Into<String>, owners: Arc<OwnerResolver>) -> Self {
        Self {
            data_source: data_source.into(),
            owners,
        }
    }

    /// Build every draft declared in the manifest.
    ///
    /// `prefix` is prepended to `database.schema.name`; a trailing `.` is
    /// added when missing.
    pub async fn build(&self, manifest: &ManifestDocument, prefix: &str) -> DraftBuild {
        let prefix = normalize_prefix(prefix);
        let mut build = DraftBuild {
            sets: DraftSets::new(source_tag(&manifest.metadata.project_name)),
            errors: Vec::new(),
        };

        for resource in manifest.nodes.values() {
            if !resource.is_supported() {
                continue;
            }

            let fullname = resource.fullname(&prefix);

            for directive in &resource.meta.raito.grant {
                self.add_grant(&mut build, &fullname, directive).await;
            }

            for directive in &resource.meta.raito.filter {
                self.add_filter(&mut build, &fullname, directive).await;
            }

            self.add_masks(&mut build, &fullname, resource).await;
        }

        tracing::debug!(
            "Built {} grants, {} filters, {} masks for source '{}' ({} conflicts)",
            build.sets.grants.len(),
            build.sets.filters.len(),
            build.sets.masks.len(),
            build.sets.source,
            build.errors.len()
        );

        build
    }

    async fn add_grant(&self, build: &mut DraftBuild, fullname: &str, directive: &GrantDirective) {
        let owners = self
            .resolve_owners(PolicyKind::Grant, &directive.name, &directive.owners)
            .await;

        let draft = build
            .sets
            .grants
            .remove(&directive.name)
            .unwrap_or_else(|| {
                PolicyDraft::grant(&directive.name, &self.data_source, &build.sets.source)
            })
            .with_target(TargetObject::object(fullname).with_permissions(
                directive.permissions.clone(),
                directive.global_permissions.clone(),
            ))
            .with_owners(owners);

        build.sets.grants.insert(directive.name.clone(), draft);
    }

    async fn add_filter(&self, build: &mut DraftBuild, fullname: &str, directive: &FilterDirective) {
        if build.sets.filters.contains_key(&directive.name) {
            build
                .errors
                .push(ValidationError::DuplicateFilter(directive.name.clone()));
            return;
        }

        let owners = self
            .resolve_owners(PolicyKind::Filter, &directive.name, &directive.owners)
            .await;

        let draft = PolicyDraft::filter(
            &directive.name,
            &self.data_source,
            &build.sets.source,
            &directive.policy_rule,
        )
        .with_target(TargetObject::object(fullname))
        .with_owners(owners);

        build.sets.filters.insert(directive.name.clone(), draft);
    }

    async fn add_masks(&self, build: &mut DraftBuild, fullname: &str, resource: &ManifestResource) {
        for (key, column) in &resource.columns {
            let Some(directive) = &column.meta.raito.mask else {
                continue;
            };
            let column_name = if column.name.is_empty() { key } else { &column.name };

            if let Err(err) = self.add_mask(build, fullname, column_name, directive).await {
                build.errors.push(err);
            }
        }
    }

    async fn add_mask(
        &self,
        build: &mut DraftBuild,
        fullname: &str,
        column: &str,
        directive: &MaskDirective,
    ) -> Result<(), ValidationError> {
        let draft = match build.sets.masks.get(&directive.name) {
            Some(existing) => {
                if let (Some(current), Some(declared)) = (&existing.mask_type, &directive.mask_type) {
                    if current != declared {
                        return Err(ValidationError::MaskTypeConflict(directive.name.clone()));
                    }
                }

                if existing.base_objects().iter().any(|object| *object != fullname) {
                    return Err(ValidationError::CrossTableMask(directive.name.clone()));
                }

                let mut draft = existing.clone();
                if draft.mask_type.is_none() {
                    draft.mask_type = directive.mask_type.clone();
                }
                draft
            }
            None => PolicyDraft::mask(
                &directive.name,
                &self.data_source,
                &build.sets.source,
                directive.mask_type.clone(),
            ),
        };

        let owners = self
            .resolve_owners(PolicyKind::Mask, &directive.name, &directive.owners)
            .await;

        let draft = draft
            .with_target(TargetObject::column(fullname, column))
            .with_owners(owners);

        build.sets.masks.insert(directive.name.clone(), draft);
        Ok(())
    }

    async fn resolve_owners(&self, kind: PolicyKind, name: &str, emails: &[String]) -> Vec<String> {
        if emails.is_empty() {
            return Vec::new();
        }

        let resolved = self.owners.resolve(emails).await;
        if let Some(err) = &resolved.error {
            tracing::warn!("Owners of {} '{}' partially resolved: {}", kind, name, err);
        }

        resolved.ids
    }
}
