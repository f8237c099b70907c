//! HTTP surface and storage-engine coordination for iotafs.

pub mod error;
pub mod handlers;
pub mod planner;
pub mod routes;
pub mod state;
pub mod vacuum;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
