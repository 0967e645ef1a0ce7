//! HTTP surface for Modelforge: the axum router over every platform
//! operation, the response envelope, tenant-scoped rate limiting, and the
//! composition root that wires storage, preprocessing, pooling, training,
//! serving and operations together.

pub mod envelope;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use envelope::{Envelope, Pagination};
pub use error::{ApiError, ApiResult};
pub use rate_limit::{RateDecision, RateLimiter};
pub use routes::create_router;
pub use state::AppState;
