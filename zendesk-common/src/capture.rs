use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use posthog_rs::{Client, ClientOptions, Event};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to build event {event}: {message}")]
    InvalidEvent { event: String, message: String },
    #[error("failed to capture event {event}: {message}")]
    Send { event: String, message: String },
}

/// An analytics event ready to be handed to the capture sink.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvent {
    pub event: String,
    pub distinct_id: String,
    pub properties: Map<String, Value>,
}

#[async_trait]
pub trait CaptureSink: Send + Sync {
    async fn capture(&self, event: CapturedEvent) -> Result<(), CaptureError>;
}

pub struct PostHogSink {
    client: Client,
}

impl PostHogSink {
    pub async fn new(api_key: &str, endpoint: &str) -> Self {
        let options: ClientOptions = (api_key, endpoint).into();
        Self {
            client: posthog_rs::client(options).await,
        }
    }
}

fn convert_event(captured: CapturedEvent) -> Result<Event, CaptureError> {
    let mut event = Event::new(&captured.event, &captured.distinct_id);

    for (key, value) in captured.properties {
        event
            .insert_prop(&key, value)
            .map_err(|e| CaptureError::InvalidEvent {
                event: captured.event.clone(),
                message: e.to_string(),
            })?;
    }

    Ok(event)
}

#[async_trait]
impl CaptureSink for PostHogSink {
    async fn capture(&self, event: CapturedEvent) -> Result<(), CaptureError> {
        let name = event.event.clone();
        let event = convert_event(event)?;

        self.client
            .capture(event)
            .await
            .map_err(|e| CaptureError::Send {
                event: name,
                message: e.to_string(),
            })
    }
}

/// Keeps captured events in memory, in order.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl CaptureSink for MemorySink {
    async fn capture(&self, event: CapturedEvent) -> Result<(), CaptureError> {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}
