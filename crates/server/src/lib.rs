//! HTTP server for teldrive.
//!
//! This crate provides:
//! - Session login against the upstream service
//! - The file namespace API (list, create, move, copy, delete, share)
//! - Part uploads and byte-range streaming
//! - The change event feed
//! - Background cleanup jobs and the `check` command

pub mod auth;
pub mod check;
pub mod cron;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod ratelimit;
pub mod routes;
pub mod services;
pub mod state;

pub use auth::{AuthenticatedUser, TraceId};
pub use error::ApiError;
pub use ratelimit::{RateLimitState, UserIdExtension};
pub use routes::create_router;
pub use state::AppState;
