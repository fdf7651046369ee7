//! # Zendesk
//!
//! Typed access to the three Zendesk REST endpoints the sync relies on: the ticket list,
//! user lookup and user custom field updates.
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{RetryingClient, TransportError};
use crate::config::SessionConfig;

const TICKETS_PATH: &str = "api/v2/tickets.json";
const USERS_PATH: &str = "api/v2/users/";

#[derive(Error, Debug)]
pub enum ZendeskError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{method} {url} returned unexpected status {status}")]
    UnexpectedStatus {
        method: Method,
        url: Url,
        status: StatusCode,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid url {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("unable to access Zendesk APIs for {host_name}: status {status}")]
    Configuration {
        host_name: String,
        status: StatusCode,
    },
}

/// A ticket as returned by the ticket list endpoint. Only the fields we forward are kept.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Ticket {
    pub id: u64,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    #[serde(rename = "type")]
    pub ticket_type: Option<String>,
    pub raw_subject: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub recipient: Option<String>,
    pub requester_id: u64,
    pub submitter_id: Option<u64>,
    pub assignee_id: Option<u64>,
    pub organization_id: Option<u64>,
    pub group_id: Option<u64>,
    pub is_public: Option<bool>,
    pub due_at: Option<String>,
    pub ticket_form_id: Option<u64>,
    pub brand_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TicketPage {
    #[serde(default)]
    tickets: Vec<Ticket>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
    pub id: u64,
    /// Users created from phone or social channels have no email.
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: User,
}

pub struct ZendeskClient {
    host_name: String,
    http: RetryingClient,
    tickets_url: Url,
    users_url: Url,
}

impl ZendeskClient {
    pub fn new(session: &SessionConfig) -> Result<Self, ZendeskError> {
        let http = RetryingClient::new(session).map_err(ZendeskError::ClientBuild)?;
        Self::with_http_client(session, http)
    }

    pub fn with_http_client(
        session: &SessionConfig,
        http: RetryingClient,
    ) -> Result<Self, ZendeskError> {
        let mut tickets_url = session.base_url.join(TICKETS_PATH)?;
        tickets_url
            .query_pairs_mut()
            .append_pair("sort_order", "desc")
            .append_pair("sort_by", "id");

        Ok(Self {
            host_name: session.host_name.clone(),
            http,
            tickets_url,
            users_url: session.base_url.join(USERS_PATH)?,
        })
    }

    /// Startup check that the credentials can read the ticket list.
    pub async fn verify_access(&self) -> Result<(), ZendeskError> {
        let response = self
            .http
            .request(Method::GET, self.tickets_url.clone(), None)
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ZendeskError::Configuration {
                host_name: self.host_name.clone(),
                status,
            });
        }

        info!("initial setup with Zendesk for {} successful", self.host_name);
        Ok(())
    }

    /// Fetch one page (1-based) of tickets, newest first by id.
    pub async fn fetch_ticket_page(&self, page: u32) -> Result<Vec<Ticket>, ZendeskError> {
        let mut url = self.tickets_url.clone();
        url.query_pairs_mut()
            .append_pair("page", &page.to_string());

        let response = self.get_success(url.clone()).await?;
        let page: TicketPage = response
            .json()
            .await
            .map_err(|source| ZendeskError::Decode { url, source })?;

        debug!(tickets = page.tickets.len(), "fetched ticket page");
        Ok(page.tickets)
    }

    pub async fn fetch_user(&self, user_id: u64) -> Result<User, ZendeskError> {
        let url = self.user_url(user_id)?;

        let response = self.get_success(url.clone()).await?;
        let envelope: UserEnvelope = response
            .json()
            .await
            .map_err(|source| ZendeskError::Decode { url, source })?;

        Ok(envelope.user)
    }

    /// Set one `user_fields` entry on a user. The response status is returned unchecked.
    pub async fn update_user_field(
        &self,
        user_id: u64,
        field: &str,
        value: &str,
    ) -> Result<StatusCode, ZendeskError> {
        let url = self.user_url(user_id)?;
        let mut user_fields = serde_json::Map::new();
        user_fields.insert(field.to_owned(), json!(value));
        let body = json!({ "user": { "user_fields": user_fields } });

        let response = self.http.request(Method::PUT, url, Some(&body)).await?;
        Ok(response.status())
    }

    fn user_url(&self, user_id: u64) -> Result<Url, ZendeskError> {
        Ok(self.users_url.join(&user_id.to_string())?)
    }

    async fn get_success(&self, url: Url) -> Result<reqwest::Response, ZendeskError> {
        let response = self.http.request(Method::GET, url.clone(), None).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ZendeskError::UnexpectedStatus {
                method: Method::GET,
                url,
                status,
            });
        }

        Ok(response)
    }
}
