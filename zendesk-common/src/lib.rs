pub mod capture;
pub mod client;
pub mod config;
pub mod metrics;
pub mod storage;
pub mod zendesk;
