// ABOUTME: Internal HTTP surface of the orchestrator process
// ABOUTME: Serves the browser readiness callback and a health probe

pub mod api;
pub mod error;
pub mod middleware;

pub use api::{create_router, AppState};
pub use error::AppError;
