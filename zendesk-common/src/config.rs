use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time;

use base64::Engine;
use envconfig::Envconfig;
use thiserror::Error;
use url::Url;

/// Connection settings for a Zendesk account, shared by every binary.
#[derive(Envconfig, Clone)]
pub struct ZendeskConfig {
    #[envconfig(from = "ZENDESK_HOST_NAME")]
    pub host_name: String,

    #[envconfig(from = "ZENDESK_USER_EMAIL")]
    pub user_email: String,

    #[envconfig(from = "ZENDESK_API_KEY")]
    pub api_key: String,

    /// Overrides `https://{host_name}.zendesk.com/`. Useful against a local mock.
    #[envconfig(from = "ZENDESK_API_BASE_URL")]
    pub api_base_url: Option<String>,

    #[envconfig(from = "TRIGGERING_EVENTS", default = "")]
    pub triggering_events: CommaSeparated,

    #[envconfig(from = "IGNORED_EMAILS", default = "")]
    pub ignored_emails: CommaSeparated,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "30000")]
    pub request_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct StorageConfig {
    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(from = "STORAGE_KEY_PREFIX", default = "zendesk")]
    pub key_prefix: String,
}

#[derive(Envconfig, Clone)]
pub struct CaptureConfig {
    #[envconfig(from = "POSTHOG_API_KEY")]
    pub posthog_api_key: String,

    #[envconfig(from = "POSTHOG_ENDPOINT", default = "https://us.i.posthog.com")]
    pub posthog_endpoint: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid Zendesk base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Immutable session settings, built once at startup and shared by reference.
#[derive(Clone)]
pub struct SessionConfig {
    pub host_name: String,
    pub base_url: Url,
    pub user_email: String,
    pub api_key: String,
    pub triggering_events: HashSet<String>,
    pub ignored_email_domains: HashSet<String>,
    pub request_timeout: time::Duration,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host_name", &self.host_name)
            .field("base_url", &self.base_url.as_str())
            .field("user_email", &self.user_email)
            .field("api_key", &"<redacted>")
            .field("triggering_events", &self.triggering_events)
            .field("ignored_email_domains", &self.ignored_email_domains)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(host_name: &str, user_email: &str, api_key: &str) -> Result<Self, ConfigError> {
        let base_url = parse_base_url(&format!("https://{host_name}.zendesk.com/"))?;

        Ok(Self {
            host_name: host_name.to_owned(),
            base_url,
            user_email: user_email.to_owned(),
            api_key: api_key.to_owned(),
            triggering_events: HashSet::new(),
            ignored_email_domains: HashSet::new(),
            request_timeout: time::Duration::from_secs(30),
        })
    }

    pub fn from_env_config(config: &ZendeskConfig) -> Result<Self, ConfigError> {
        let mut session = Self::new(&config.host_name, &config.user_email, &config.api_key)?
            .with_triggering_events(config.triggering_events.0.iter())
            .with_ignored_email_domains(config.ignored_emails.0.iter())
            .with_request_timeout(config.request_timeout.0);

        if let Some(base_url) = &config.api_base_url {
            session = session.with_base_url(base_url)?;
        }

        Ok(session)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_triggering_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.triggering_events = events.into_iter().map(|e| e.as_ref().to_owned()).collect();
        self
    }

    pub fn with_ignored_email_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignored_email_domains = domains.into_iter().map(|d| d.as_ref().to_owned()).collect();
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: time::Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Value for the `Authorization` header: Zendesk API token auth over Basic.
    pub fn basic_auth_header(&self) -> String {
        let credentials = format!("{}/token:{}", self.user_email, self.api_key);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }
}

/// `Url::join` drops the last path segment unless the base ends with a slash.
fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let normalized = if raw.ends_with('/') {
        raw.to_owned()
    } else {
        format!("{raw}/")
    };

    Url::parse(&normalized).map_err(|source| ConfigError::InvalidBaseUrl {
        url: raw.to_owned(),
        source,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma separated list. Entries are trimmed and empty entries dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}
