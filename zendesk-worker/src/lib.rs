pub mod config;
pub mod error;
pub mod identity;
pub mod ingestion;
pub mod scheduler;
