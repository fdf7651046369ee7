//! # Client
//!
//! HTTP client used for every call to the Zendesk API.
//!
//! Transport failures (connection errors, timeouts) are retried exactly once with the same
//! request. There is no backoff between the two attempts and no retry budget. HTTP error
//! statuses are returned to the caller untouched: inspecting the status is the caller's job.
use std::time;

use reqwest::{header, Method, Response, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::SessionConfig;

/// A request that failed at the transport level on both attempts.
#[derive(Error, Debug)]
#[error("{method} {url} failed after one retry: {source}")]
pub struct TransportError {
    pub method: Method,
    pub url: Url,
    #[source]
    pub source: reqwest::Error,
}

#[derive(Clone)]
pub struct RetryingClient {
    client: reqwest::Client,
}

pub fn build_http_client(
    request_timeout: time::Duration,
    authorization: &str,
) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    if let Ok(mut value) = header::HeaderValue::from_str(authorization) {
        value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, value);
    } else {
        warn!("authorization header contains invalid characters, sending requests without it");
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("PostHog Zendesk Sync")
        .timeout(request_timeout)
        .build()
}

impl RetryingClient {
    pub fn new(session: &SessionConfig) -> reqwest::Result<Self> {
        let client = build_http_client(session.request_timeout, &session.basic_auth_header())?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send a request, retrying once if the first attempt fails before a response arrives.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Response, TransportError> {
        let labels = [("method", method.to_string())];
        metrics::counter!("zendesk_http_requests_total", &labels).increment(1);

        match self.send(method.clone(), url.clone(), body).await {
            Ok(response) => return Ok(response),
            Err(error) => {
                warn!(%method, %url, "request failed, retrying once: {}", error);
                metrics::counter!("zendesk_http_retries_total", &labels).increment(1);
            }
        }

        self.send(method.clone(), url.clone(), body)
            .await
            .map_err(|source| {
                metrics::counter!("zendesk_http_transport_failures_total", &labels).increment(1);
                TransportError {
                    method,
                    url,
                    source,
                }
            })
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> reqwest::Result<Response> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await
    }
}
