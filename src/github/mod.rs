//! GitHub source adapters.
//!
//! Two independent feeds cover GitHub activity: the mail archive (push-like,
//! others' activity and notifications) and the public-events list endpoint
//! (pull-based, the served user's own activity). Both merge into the shared
//! caches through the service facade, which deduplicates by identity.

pub mod api;
pub mod convert;
pub mod list;
pub mod mail;

pub use api::{GithubApi, GithubReadState, GithubRest};
pub use list::GithubListPoller;
pub use mail::GithubMailAdapter;
