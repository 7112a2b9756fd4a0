//! HTTP API for the chat gateway

pub mod handlers;
pub mod models;
pub mod routes;

pub use handlers::{error_response, AppState};
pub use models::{error_codes, ApiError};
pub use routes::build_router;
