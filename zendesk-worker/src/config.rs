use std::time;

use envconfig::Envconfig;
use zendesk_common::config::{CaptureConfig, EnvMsDuration, StorageConfig, ZendeskConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    /// Written into the ingestion lock so a stuck holder can be identified.
    #[envconfig(default = "worker")]
    pub worker_name: String,

    #[envconfig(default = "60000")]
    pub ingestion_interval: EnvMsDuration,

    #[envconfig(default = "300")]
    pub ingestion_lock_ttl_secs: u64,

    #[envconfig(nested = true)]
    pub zendesk: ZendeskConfig,

    #[envconfig(nested = true)]
    pub storage: StorageConfig,

    #[envconfig(nested = true)]
    pub capture: CaptureConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ingestion_lock_ttl(&self) -> time::Duration {
        time::Duration::from_secs(self.ingestion_lock_ttl_secs)
    }

    /// A run may take up to the lock TTL, and then the next tick is one interval away.
    pub fn liveness_deadline(&self) -> time::Duration {
        self.ingestion_lock_ttl() + self.ingestion_interval.0
    }
}
