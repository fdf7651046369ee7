use std::time;

use health::HealthHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use zendesk_common::storage::SyncStore;

use crate::error::IngestionError;
use crate::ingestion::{IngestionSummary, TicketIngestion};

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(IngestionSummary),
    /// Another run held the ingestion lock.
    Skipped,
}

/// Triggers ticket ingestion on a fixed interval, one run at a time across all workers
/// sharing the same storage.
pub struct IngestionScheduler {
    ingestion: TicketIngestion,
    store: SyncStore,
    worker_name: String,
    interval: time::Duration,
    lock_ttl: time::Duration,
    liveness: HealthHandle,
}

impl IngestionScheduler {
    pub fn new(
        ingestion: TicketIngestion,
        store: SyncStore,
        worker_name: &str,
        interval: time::Duration,
        lock_ttl: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            ingestion,
            store,
            worker_name: worker_name.to_owned(),
            interval,
            lock_ttl,
            liveness,
        }
    }

    /// Run ingestion once if no other run is in progress. The lock is released whatever
    /// the outcome of the run.
    pub async fn run_once(&self) -> Result<RunOutcome, IngestionError> {
        if !self
            .store
            .try_lock_ingestion(&self.worker_name, self.lock_ttl)
            .await?
        {
            warn!("another ingestion run is in progress, skipping this tick");
            metrics::counter!("zendesk_ingestion_runs_total", "outcome" => "skipped").increment(1);
            return Ok(RunOutcome::Skipped);
        }

        let start = tokio::time::Instant::now();
        let result = self.ingestion.run().await;
        metrics::histogram!("zendesk_ingestion_run_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        if let Err(e) = self.store.unlock_ingestion().await {
            error!("failed to release ingestion lock: {}", e);
        }

        match result {
            Ok(summary) => {
                metrics::counter!("zendesk_ingestion_runs_total", "outcome" => "completed")
                    .increment(1);
                info!(
                    pages = summary.pages_fetched,
                    emitted = summary.tickets_emitted,
                    skipped = summary.tickets_skipped,
                    stopped_at = ?summary.stopped_at,
                    "ingestion run completed"
                );
                Ok(RunOutcome::Completed(summary))
            }
            Err(e) => {
                metrics::counter!("zendesk_ingestion_runs_total", "outcome" => "failed")
                    .increment(1);
                Err(e)
            }
        }
    }

    /// Tick forever. Failed runs are logged and retried on the next tick.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            if let Err(e) = self.run_once().await {
                error!("ingestion run failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use health::HealthRegistry;
    use httpmock::prelude::*;
    use serde_json::json;
    use zendesk_common::capture::MemorySink;
    use zendesk_common::config::SessionConfig;
    use zendesk_common::storage::MemoryStorage;
    use zendesk_common::zendesk::ZendeskClient;

    fn scheduler(server: &MockServer, store: &SyncStore) -> IngestionScheduler {
        let session = SessionConfig::new("acme", "ops@acme.com", "secret")
            .unwrap()
            .with_base_url(&server.base_url())
            .unwrap();
        let zendesk = Arc::new(ZendeskClient::new(&session).unwrap());
        let ingestion = TicketIngestion::new(zendesk, store.clone(), Arc::new(MemorySink::new()));
        let liveness = HealthRegistry::new("liveness")
            .register("ingestion", time::Duration::from_secs(30));

        IngestionScheduler::new(
            ingestion,
            store.clone(),
            "test-worker",
            time::Duration::from_millis(10),
            time::Duration::from_secs(60),
            liveness,
        )
    }

    fn store(memory: &MemoryStorage) -> SyncStore {
        SyncStore::new(Arc::new(memory.clone()), "zendesk")
    }

    #[tokio::test]
    async fn test_skips_when_lock_is_held() {
        let server = MockServer::start_async().await;
        let tickets = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/tickets.json");
                then.status(200).json_body(json!({"tickets": []}));
            })
            .await;
        let memory = MemoryStorage::new();
        let store = store(&memory);
        assert!(store
            .try_lock_ingestion("other-worker", time::Duration::from_secs(60))
            .await
            .unwrap());

        let outcome = scheduler(&server, &store).run_once().await.unwrap();

        assert_eq!(outcome, RunOutcome::Skipped);
        tickets.assert_hits_async(0).await;
        assert_eq!(
            memory.snapshot().get("zendesk:ingestion-lock"),
            Some(&"other-worker".to_owned())
        );
    }

    #[tokio::test]
    async fn test_completed_run_releases_lock() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/tickets.json");
                then.status(200).json_body(json!({"tickets": []}));
            })
            .await;
        let memory = MemoryStorage::new();
        let store = store(&memory);

        let outcome = scheduler(&server, &store).run_once().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed(IngestionSummary {
                pages_fetched: 1,
                tickets_emitted: 0,
                tickets_skipped: 0,
                stopped_at: None,
            })
        );
        assert!(!memory.snapshot().contains_key("zendesk:ingestion-lock"));
    }

    #[tokio::test]
    async fn test_failed_run_releases_lock() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/tickets.json");
                then.status(500);
            })
            .await;
        let memory = MemoryStorage::new();
        let store = store(&memory);

        let result = scheduler(&server, &store).run_once().await;

        assert!(result.is_err());
        assert!(!memory.snapshot().contains_key("zendesk:ingestion-lock"));
    }
}
