//! Newline-delimited JSON requests from the host UI, dispatched to handler families.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
