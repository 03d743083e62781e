//! Online, zero-downtime data migration between two live SQLite stores.
//!
//! - [`proxy::DualWritePool`] duplicates writes under a runtime-switchable
//!   [`pattern::Pattern`].
//! - [`validator::Validator`] scans both stores and publishes an
//!   [`event::InconsistentEvent`] per divergence.
//! - [`fixer::Fixer`] consumes those events and repairs the target store from
//!   the base store.

pub mod channel;
pub mod config;
pub mod db;
mod error;
pub mod event;
pub mod fixer;
pub mod logging;
pub mod pattern;
pub mod proxy;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod time;
pub mod validator;

pub use error::{AppError, AppResult};
