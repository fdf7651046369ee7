use std::sync::Arc;

use tracing::debug;
use zendesk_common::storage::SyncStore;
use zendesk_common::zendesk::ZendeskClient;

use crate::error::IngestionError;

/// Resolves a ticket requester to an email address.
///
/// Every call hits the Zendesk users endpoint; the stored mapping is written, never read, here.
/// The user sync path reads it back later.
pub struct IdentityResolver {
    zendesk: Arc<ZendeskClient>,
    store: SyncStore,
}

impl IdentityResolver {
    pub fn new(zendesk: Arc<ZendeskClient>, store: SyncStore) -> Self {
        Self { zendesk, store }
    }

    /// `None` when the requester has no email on file. Nothing is stored in that case.
    pub async fn resolve(&self, requester_id: u64) -> Result<Option<String>, IngestionError> {
        let user = self.zendesk.fetch_user(requester_id).await?;

        let Some(email) = user.email else {
            debug!(requester_id, "requester has no email");
            return Ok(None);
        };

        self.store.remember_requester(&email, user.id).await?;
        debug!(requester_id, user_id = user.id, "resolved requester");

        Ok(Some(email))
    }
}
