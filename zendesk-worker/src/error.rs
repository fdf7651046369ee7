use thiserror::Error;
use zendesk_common::capture::CaptureError;
use zendesk_common::storage::StorageError;
use zendesk_common::zendesk::ZendeskError;

/// Errors that abort an ingestion run. Markers already written stay written.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error(transparent)]
    Zendesk(#[from] ZendeskError),
    #[error("storage failed during ingestion: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to encode ticket properties: {0}")]
    Encode(#[from] serde_json::Error),
}
