//! # prlens-core
//!
//! Shared vocabulary for the prlens event pipeline.
//!
//! - **Events**: [`events::Event`], the closed set of things the agent
//!   runtime can tell a review session, and its `data: <json>` wire frame
//! - **Errors**: [`errors::ConnectionError`] and [`errors::ControlError`]
//!   via `thiserror`, each with a short `kind()` classification
//! - **Retry**: [`retry::BackoffPolicy`] exponential backoff with jitter
//! - **Text**: UTF-8 safe truncation for log previews
//! - **Logging**: [`logging::init_logging`] tracing subscriber setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other prlens crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod logging;
pub mod retry;
pub mod text;

pub use errors::{ConnectionError, ControlError};
pub use events::{Event, SessionStatus};
