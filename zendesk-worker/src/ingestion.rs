//! # Ingestion
//!
//! Incremental sync of new Zendesk tickets into analytics events.
//!
//! Tickets are read page by page, newest first by id. Each ticket not seen before is marked
//! seen, its requester resolved to an email, and a `zendesk_ticket` event captured for it.
//! The first already-seen ticket ends the whole run: with a feed strictly ordered by
//! descending id, everything after it was handled by an earlier run.
//!
//! That stop rule relies on the feed order. If Zendesk ever returned an older ticket ahead of
//! newer unseen ones, the run would stop at the older ticket and the newer ones below it would
//! not be reached. `test_stop_rule_assumes_strict_id_order` pins this behavior down.
//!
//! A failure aborts the run after the failing ticket was marked seen. The next run stops at
//! the newest ticket marked before the failure, so the older new tickets the failed run never
//! reached are skipped for good. `test_failure_skips_unreached_tickets_next_run` pins this down.
//!
//! A requester without an email cannot be an event's distinct id. Such tickets stay marked and
//! are counted as skipped, and the run carries on.
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use zendesk_common::capture::{CaptureSink, CapturedEvent};
use zendesk_common::storage::SyncStore;
use zendesk_common::zendesk::{Ticket, ZendeskClient};

use crate::error::IngestionError;
use crate::identity::IdentityResolver;

pub const TICKET_EVENT: &str = "zendesk_ticket";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionSummary {
    pub pages_fetched: u32,
    pub tickets_emitted: u32,
    pub tickets_skipped: u32,
    /// The already-seen ticket the run stopped at, if it did not run off the end of the feed.
    pub stopped_at: Option<u64>,
}

#[derive(Serialize)]
struct PersonProperties {
    #[serde(rename = "zendeskId")]
    zendesk_id: u64,
}

#[derive(Serialize)]
struct TicketProperties {
    #[serde(rename = "$set")]
    set: PersonProperties,
    #[serde(rename = "ticketId")]
    ticket_id: u64,
    created_at: Option<String>,
    updated_at: Option<String>,
    #[serde(rename = "type")]
    ticket_type: Option<String>,
    subject: Option<String>,
    description: Option<String>,
    priority: Option<String>,
    status: Option<String>,
    recipient: Option<String>,
    requester_id: u64,
    submitter_id: Option<u64>,
    assignee_id: Option<u64>,
    organization_id: Option<u64>,
    group_id: Option<u64>,
    is_public: Option<bool>,
    due_at: Option<String>,
    ticket_form_id: Option<u64>,
    brand_id: Option<u64>,
}

impl From<Ticket> for TicketProperties {
    fn from(ticket: Ticket) -> Self {
        Self {
            set: PersonProperties {
                zendesk_id: ticket.requester_id,
            },
            ticket_id: ticket.id,
            created_at: ticket.created_at,
            updated_at: ticket.updated_at,
            ticket_type: ticket.ticket_type,
            subject: ticket.raw_subject,
            description: ticket.description,
            priority: ticket.priority,
            status: ticket.status,
            recipient: ticket.recipient,
            requester_id: ticket.requester_id,
            submitter_id: ticket.submitter_id,
            assignee_id: ticket.assignee_id,
            organization_id: ticket.organization_id,
            group_id: ticket.group_id,
            is_public: ticket.is_public,
            due_at: ticket.due_at,
            ticket_form_id: ticket.ticket_form_id,
            brand_id: ticket.brand_id,
        }
    }
}

/// Build the analytics event for a ticket whose requester resolved to `email`.
pub fn ticket_event(ticket: Ticket, email: String) -> Result<CapturedEvent, IngestionError> {
    let properties: Map<String, Value> =
        serde_json::from_value(serde_json::to_value(TicketProperties::from(ticket))?)?;

    Ok(CapturedEvent {
        event: TICKET_EVENT.to_owned(),
        distinct_id: email,
        properties,
    })
}

pub struct TicketIngestion {
    zendesk: Arc<ZendeskClient>,
    store: SyncStore,
    resolver: IdentityResolver,
    sink: Arc<dyn CaptureSink>,
}

impl TicketIngestion {
    pub fn new(zendesk: Arc<ZendeskClient>, store: SyncStore, sink: Arc<dyn CaptureSink>) -> Self {
        let resolver = IdentityResolver::new(zendesk.clone(), store.clone());
        Self {
            zendesk,
            store,
            resolver,
            sink,
        }
    }

    /// Run one ingestion pass. Any error aborts the pass at the ticket it happened on.
    pub async fn run(&self) -> Result<IngestionSummary, IngestionError> {
        let mut summary = IngestionSummary::default();
        let mut page = 1;

        loop {
            let tickets = self.zendesk.fetch_ticket_page(page).await?;
            summary.pages_fetched += 1;
            metrics::counter!("zendesk_ingestion_pages_fetched_total").increment(1);

            if tickets.is_empty() {
                debug!(page, "ticket feed exhausted");
                return Ok(summary);
            }

            for ticket in tickets {
                let ticket_id = ticket.id;
                if self.store.is_ticket_seen(ticket_id).await? {
                    debug!(ticket_id, page, "reached a ticket from a previous run");
                    summary.stopped_at = Some(ticket_id);
                    return Ok(summary);
                }

                // The marker must be durable before the event is captured.
                self.store.mark_ticket_seen(ticket_id).await?;

                let Some(email) = self.resolver.resolve(ticket.requester_id).await? else {
                    warn!(
                        ticket_id,
                        requester_id = ticket.requester_id,
                        "requester has no email, skipping ticket"
                    );
                    metrics::counter!(
                        "zendesk_tickets_skipped_total",
                        "reason" => "requester_without_email"
                    )
                    .increment(1);
                    summary.tickets_skipped += 1;
                    continue;
                };
                self.sink.capture(ticket_event(ticket, email)?).await?;

                summary.tickets_emitted += 1;
                metrics::counter!("zendesk_tickets_emitted_total").increment(1);
                info!(ticket_id, "captured new ticket");
            }

            page += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use httpmock::prelude::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use zendesk_common::capture::MemorySink;
    use zendesk_common::config::SessionConfig;
    use zendesk_common::storage::MemoryStorage;
    use zendesk_common::zendesk::ZendeskError;

    struct Harness {
        server: MockServer,
        memory: MemoryStorage,
        store: SyncStore,
        sink: MemorySink,
        ingestion: TicketIngestion,
    }

    fn ingestion_at(base_url: &str, store: &SyncStore, sink: &MemorySink) -> TicketIngestion {
        let session = SessionConfig::new("acme", "ops@acme.com", "secret")
            .unwrap()
            .with_base_url(base_url)
            .unwrap();
        let zendesk = Arc::new(ZendeskClient::new(&session).unwrap());
        TicketIngestion::new(zendesk, store.clone(), Arc::new(sink.clone()))
    }

    async fn harness() -> Harness {
        let server = MockServer::start_async().await;
        let memory = MemoryStorage::new();
        let store = SyncStore::new(Arc::new(memory.clone()), "zendesk");
        let sink = MemorySink::new();
        let ingestion = ingestion_at(&server.base_url(), &store, &sink);

        Harness {
            server,
            memory,
            store,
            sink,
            ingestion,
        }
    }

    /// Answers the ticket list with `tickets` and user lookups with a generated email, over raw
    /// TCP. Connections asking for `dropped_user` are closed without an answer. Returns the base
    /// url and the number of dropped connections.
    async fn dropping_server(tickets: Vec<Value>, dropped_user: u64) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        let dropped_path = format!("/api/v2/users/{dropped_user} ");

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let Ok(read) = socket.read(&mut buf).await else {
                    continue;
                };
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let request_line = request.lines().next().unwrap_or_default().to_owned();

                if request_line.contains(&dropped_path) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    drop(socket);
                    continue;
                }

                let body = if request_line.contains("/api/v2/tickets.json") {
                    json!({ "tickets": tickets.clone() })
                } else {
                    let user_id: u64 = request_line
                        .split("/api/v2/users/")
                        .nth(1)
                        .and_then(|rest| rest.split(' ').next())
                        .and_then(|id| id.parse().ok())
                        .unwrap_or_default();
                    json!({"user": {"id": user_id, "email": format!("user{user_id}@example.com")}})
                }
                .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        (format!("http://{addr}"), dropped)
    }

    /// Ticket `id` is requested by user `id + 1000`.
    fn ticket(id: u64) -> Value {
        json!({
            "id": id,
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T11:00:00Z",
            "type": "question",
            "subject": "Ticket subject",
            "raw_subject": format!("Ticket {id}"),
            "description": "Help",
            "priority": "normal",
            "status": "open",
            "recipient": null,
            "requester_id": id + 1000,
            "submitter_id": id + 1000,
            "assignee_id": 5,
            "organization_id": null,
            "group_id": 9,
            "is_public": true,
            "due_at": null,
            "ticket_form_id": 11,
            "brand_id": 12
        })
    }

    async fn mock_page<'a>(server: &'a MockServer, page: u32, ids: &[u64]) -> httpmock::Mock<'a> {
        let tickets: Vec<Value> = ids.iter().copied().map(ticket).collect();
        let page = page.to_string();
        server
            .mock_async(move |when, then| {
                when.method(GET)
                    .path("/api/v2/tickets.json")
                    .query_param("sort_order", "desc")
                    .query_param("sort_by", "id")
                    .query_param("page", page.as_str());
                then.status(200).json_body(json!({ "tickets": tickets }));
            })
            .await
    }

    async fn mock_user(server: &MockServer, user_id: u64) -> httpmock::Mock<'_> {
        server
            .mock_async(move |when, then| {
                when.method(GET).path(format!("/api/v2/users/{user_id}"));
                then.status(200).json_body(json!({
                    "user": { "id": user_id, "email": format!("user{user_id}@example.com") }
                }));
            })
            .await
    }

    fn emitted_ticket_ids(sink: &MemorySink) -> Vec<u64> {
        sink.events()
            .iter()
            .map(|e| e.properties["ticketId"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_stops_at_first_seen_ticket() {
        let h = harness().await;
        h.store.mark_ticket_seen(104).await.unwrap();
        let page_one = mock_page(&h.server, 1, &[105, 104, 103]).await;
        let page_two = mock_page(&h.server, 2, &[102]).await;
        let user_105 = mock_user(&h.server, 1105).await;
        let user_103 = mock_user(&h.server, 1103).await;

        let summary = h.ingestion.run().await.unwrap();

        assert_eq!(
            summary,
            IngestionSummary {
                pages_fetched: 1,
                tickets_emitted: 1,
                tickets_skipped: 0,
                stopped_at: Some(104),
            }
        );
        assert_eq!(emitted_ticket_ids(&h.sink), vec![105]);
        page_one.assert_hits_async(1).await;
        page_two.assert_hits_async(0).await;
        user_105.assert_hits_async(1).await;
        user_103.assert_hits_async(0).await;
        assert!(!h.store.is_ticket_seen(103).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_first_page() {
        let h = harness().await;
        mock_page(&h.server, 1, &[]).await;
        let users = h
            .server
            .mock_async(|when, then| {
                when.method(GET).path_contains("/api/v2/users/");
                then.status(200);
            })
            .await;

        let summary = h.ingestion.run().await.unwrap();

        assert_eq!(
            summary,
            IngestionSummary {
                pages_fetched: 1,
                tickets_emitted: 0,
                tickets_skipped: 0,
                stopped_at: None,
            }
        );
        assert!(h.sink.events().is_empty());
        users.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_pages_until_exhausted_then_never_reemits() {
        let h = harness().await;
        mock_page(&h.server, 1, &[3, 2]).await;
        mock_page(&h.server, 2, &[1]).await;
        mock_page(&h.server, 3, &[]).await;
        for user_id in [1001, 1002, 1003] {
            mock_user(&h.server, user_id).await;
        }

        let first = h.ingestion.run().await.unwrap();
        assert_eq!(first.pages_fetched, 3);
        assert_eq!(first.tickets_emitted, 3);
        assert_eq!(first.stopped_at, None);
        assert_eq!(emitted_ticket_ids(&h.sink), vec![3, 2, 1]);

        let second = h.ingestion.run().await.unwrap();
        assert_eq!(second.pages_fetched, 1);
        assert_eq!(second.tickets_emitted, 0);
        assert_eq!(second.stopped_at, Some(3));
        assert_eq!(emitted_ticket_ids(&h.sink), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_failure_mid_page_keeps_markers() {
        let h = harness().await;
        mock_page(&h.server, 1, &[2, 1]).await;
        mock_user(&h.server, 1002).await;
        h.server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/users/1001");
                then.status(500);
            })
            .await;

        let error = h.ingestion.run().await.unwrap_err();

        assert!(matches!(
            error,
            IngestionError::Zendesk(ZendeskError::UnexpectedStatus { .. })
        ));
        assert_eq!(emitted_ticket_ids(&h.sink), vec![2]);
        assert!(h.store.is_ticket_seen(2).await.unwrap());
        // Marked before its requester lookup failed, so it is not retried.
        assert!(h.store.is_ticket_seen(1).await.unwrap());

        let summary = h.ingestion.run().await.unwrap();
        assert_eq!(summary.stopped_at, Some(2));
        assert_eq!(emitted_ticket_ids(&h.sink), vec![2]);
    }

    #[tokio::test]
    async fn test_failure_skips_unreached_tickets_next_run() {
        let h = harness().await;
        mock_page(&h.server, 1, &[3, 2, 1]).await;
        mock_user(&h.server, 1003).await;
        let user_1001 = mock_user(&h.server, 1001).await;
        let failing = h
            .server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/users/1002");
                then.status(500);
            })
            .await;

        assert!(h.ingestion.run().await.is_err());
        failing.delete_async().await;
        mock_user(&h.server, 1002).await;

        let summary = h.ingestion.run().await.unwrap();

        assert_eq!(
            summary,
            IngestionSummary {
                pages_fetched: 1,
                tickets_emitted: 0,
                tickets_skipped: 0,
                stopped_at: Some(3),
            }
        );
        // Ticket 1 was new but below the failure point; no later run reaches it.
        assert_eq!(emitted_ticket_ids(&h.sink), vec![3]);
        assert!(!h.store.is_ticket_seen(1).await.unwrap());
        user_1001.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_run_and_keeps_markers() {
        let (base_url, dropped) =
            dropping_server(vec![ticket(3), ticket(2), ticket(1)], 1002).await;
        let memory = MemoryStorage::new();
        let store = SyncStore::new(Arc::new(memory.clone()), "zendesk");
        let sink = MemorySink::new();
        let ingestion = ingestion_at(&base_url, &store, &sink);

        let error = ingestion.run().await.unwrap_err();

        assert!(matches!(
            error,
            IngestionError::Zendesk(ZendeskError::Transport(_))
        ));
        assert!(error.to_string().contains("/api/v2/users/1002"));
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(emitted_ticket_ids(&sink), vec![3]);
        assert!(store.is_ticket_seen(3).await.unwrap());
        assert!(store.is_ticket_seen(2).await.unwrap());
        assert!(!store.is_ticket_seen(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_requester_without_email_is_skipped() {
        let h = harness().await;
        mock_page(&h.server, 1, &[5, 4]).await;
        mock_page(&h.server, 2, &[]).await;
        h.server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/users/1005");
                then.status(200)
                    .json_body(json!({"user": {"id": 1005, "email": null}}));
            })
            .await;
        mock_user(&h.server, 1004).await;

        let summary = h.ingestion.run().await.unwrap();

        assert_eq!(
            summary,
            IngestionSummary {
                pages_fetched: 2,
                tickets_emitted: 1,
                tickets_skipped: 1,
                stopped_at: None,
            }
        );
        assert_eq!(emitted_ticket_ids(&h.sink), vec![4]);
        assert!(h.store.is_ticket_seen(5).await.unwrap());
        assert_eq!(
            h.memory
                .snapshot()
                .keys()
                .filter(|key| key.starts_with("zendesk:user:"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_page_fetch_failure_aborts_run() {
        let h = harness().await;
        h.server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v2/tickets.json");
                then.status(503);
            })
            .await;

        let error = h.ingestion.run().await.unwrap_err();

        assert!(matches!(error, IngestionError::Zendesk(_)));
        assert!(h.memory.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_marker_written_before_capture() {
        let h = harness().await;
        mock_page(&h.server, 1, &[8]).await;
        mock_page(&h.server, 2, &[]).await;
        mock_user(&h.server, 1008).await;

        h.ingestion.run().await.unwrap();

        let ops: Vec<(&str, String)> = h
            .memory
            .get_calls()
            .into_iter()
            .map(|call| (call.op, call.key))
            .collect();
        assert_eq!(
            ops,
            vec![
                ("get", "zendesk:ticket:8".to_owned()),
                ("set", "zendesk:ticket:8".to_owned()),
                ("set", "zendesk:user:user1008@example.com".to_owned()),
            ]
        );
        assert_eq!(h.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_rule_assumes_strict_id_order() {
        // If the feed ever put an old, already seen ticket ahead of a new one, the new one
        // would be skipped by this run.
        let h = harness().await;
        h.store.mark_ticket_seen(7).await.unwrap();
        mock_page(&h.server, 1, &[7, 9]).await;
        let user_9 = mock_user(&h.server, 1009).await;

        let summary = h.ingestion.run().await.unwrap();

        assert_eq!(summary.stopped_at, Some(7));
        assert!(h.sink.events().is_empty());
        user_9.assert_hits_async(0).await;
    }

    #[test]
    fn test_ticket_event_carries_every_ticket_field() {
        let ticket: Ticket = serde_json::from_value(ticket(42)).unwrap();

        let event = ticket_event(ticket, "user1042@example.com".to_owned()).unwrap();

        assert_eq!(event.properties.len(), 19);
        assert_eq!(event.properties["ticketId"], json!(42));
        assert_eq!(event.properties["brand_id"], json!(12));
    }

    #[tokio::test]
    async fn test_ticket_event_shape() {
        let h = harness().await;
        mock_page(&h.server, 1, &[42]).await;
        mock_page(&h.server, 2, &[]).await;
        mock_user(&h.server, 1042).await;

        h.ingestion.run().await.unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event, "zendesk_ticket");
        assert_eq!(event.distinct_id, "user1042@example.com");
        assert_eq!(event.properties["$set"], json!({"zendeskId": 1042}));
        assert_eq!(event.properties["ticketId"], json!(42));
        assert_eq!(event.properties["subject"], json!("Ticket 42"));
        assert_eq!(event.properties["type"], json!("question"));
        assert_eq!(event.properties["requester_id"], json!(1042));
        assert_eq!(event.properties["assignee_id"], json!(5));
        assert_eq!(event.properties["organization_id"], Value::Null);
        assert_eq!(event.properties["is_public"], json!(true));
        assert_eq!(event.properties["created_at"], json!("2024-03-01T10:00:00Z"));
        assert!(!event.properties.contains_key("raw_subject"));
        assert!(!event.properties.contains_key("id"));
    }
}
