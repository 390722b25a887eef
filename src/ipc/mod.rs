mod error;
mod handlers;
mod helpers;
mod router;
#[cfg(test)]
mod test_fixtures;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
