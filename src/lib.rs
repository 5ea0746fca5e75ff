//! Transom: a single-user activity and notification aggregation daemon.
//!
//! Source adapters poll a framed mail archive and provider list endpoints,
//! normalize activity into a unified model, track per-thread read state
//! reconciled against the provider, and stream deltas to subscribers.

pub mod activity;
pub mod config;
pub mod error;
pub mod gerrit;
pub mod github;
pub mod http;
pub mod maillog;
pub mod router;
pub mod supervisor;
pub mod users;

pub use activity::service::{ActivityService, ListOptions};
pub use activity::{Event, Notification, Payload, ThreadKey, ThreadKind};
pub use error::AppError;
