pub mod classify;
pub mod config;
pub mod dispatch;
pub mod handlers;
