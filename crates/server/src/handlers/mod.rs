//! HTTP request handlers.

pub mod auth;
pub mod events;
pub mod files;
pub mod health;
pub mod shares;
pub mod stream;
pub mod uploads;
pub mod users;

pub use health::health_check;
