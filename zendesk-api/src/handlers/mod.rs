mod app;
mod event;

pub use app::{add_routes, AppState};
pub use event::{post_event, EventResponse, EventStatus};
