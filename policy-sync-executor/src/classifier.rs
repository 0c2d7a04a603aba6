//! Classification of existing remote policies against the desired drafts

use policy_sync_core::{DraftSets, ReconciliationPlan, RemoteRecord};
use policy_sync_remote::{ListFilter, PolicyClient, RemoteError};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Streams the remote policies of a source and builds the reconciliation plan
pub struct RemoteStateClassifier {
    client: Arc<dyn PolicyClient>,
}

impl RemoteStateClassifier {
    pub fn new(client: Arc<dyn PolicyClient>) -> Self {
        Self { client }
    }

    /// Classify every remote policy tagged with `drafts.source`.
    ///
    /// The listing runs under a child of `cancel` which is cancelled as soon
    /// as this call returns. The first failed element aborts the whole
    /// classification.
    pub async fn classify(
        &self,
        drafts: &DraftSets,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationPlan, RemoteError> {
        let listing = cancel.child_token();
        let _stop_listing = listing.clone().drop_guard();

        let mut records = self
            .client
            .list_policies(ListFilter::by_source(drafts.source.clone()), listing);

        let mut plan = ReconciliationPlan::default();
        let mut seen = 0usize;
        while let Some(record) = records.next().await {
            classify_record(&mut plan, drafts, record?);
            seen += 1;
        }

        tracing::info!(
            "Classified {} existing policies for source '{}': {} to update, {} to remove",
            seen,
            drafts.source,
            plan.grant_ids.len() + plan.filter_ids.len() + plan.mask_ids.len(),
            plan.ids_to_remove.len()
        );

        Ok(plan)
    }
}

/// Classify one record. Records are matched by name within their kind;
/// listing order breaks ties, so the first record seen for a name is kept
/// and every later one is removed.
pub fn classify_record(plan: &mut ReconciliationPlan, drafts: &DraftSets, record: RemoteRecord) {
    let Some(kind) = record.policy_kind() else {
        tracing::debug!("Ignoring policy '{}' of unmanaged kind '{}'", record.name, record.kind);
        return;
    };

    if !drafts.by_kind(kind).contains_key(&record.name) || plan.ids(kind).contains_key(&record.name) {
        plan.ids_to_remove.insert(record.id);
    } else {
        plan.ids_mut(kind).insert(record.name, record.id);
    }
}
