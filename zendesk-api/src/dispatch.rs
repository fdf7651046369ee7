use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};
use zendesk_common::storage::{StorageError, SyncStore};
use zendesk_common::zendesk::{ZendeskClient, ZendeskError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Zendesk(#[from] ZendeskError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The update was sent. `status` is whatever Zendesk answered, success or not.
    Updated { user_id: u64, status: StatusCode },
    /// No requester id is stored for the email yet.
    UnknownUser,
}

/// Writes the time of an analytics event into a custom field of the matching Zendesk user.
pub struct UserSyncDispatcher {
    zendesk: Arc<ZendeskClient>,
    store: SyncStore,
}

impl UserSyncDispatcher {
    pub fn new(zendesk: Arc<ZendeskClient>, store: SyncStore) -> Self {
        Self { zendesk, store }
    }

    pub async fn dispatch(
        &self,
        email: &str,
        event_name: &str,
        sent_at: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(user_id) = self.store.requester_id(email).await? else {
            debug!(event_name, "no zendesk user stored for email, not syncing");
            metrics::counter!("zendesk_user_sync_total", "outcome" => "unknown_user").increment(1);
            return Ok(DispatchOutcome::UnknownUser);
        };

        let status = self
            .zendesk
            .update_user_field(user_id, event_name, sent_at)
            .await?;

        if status.is_success() {
            info!(user_id, event_name, "synced event to zendesk user");
            metrics::counter!("zendesk_user_sync_total", "outcome" => "updated").increment(1);
        } else {
            warn!(user_id, event_name, %status, "zendesk rejected user field update");
            metrics::counter!("zendesk_user_sync_total", "outcome" => "rejected").increment(1);
        }

        Ok(DispatchOutcome::Updated { user_id, status })
    }
}
