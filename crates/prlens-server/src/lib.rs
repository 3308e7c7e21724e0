//! # prlens-server
//!
//! HTTP transport adapter. Each browser session drains its router
//! subscription over SSE; control requests go straight to the agent runtime.
//!
//! | Route | |
//! |-------|---|
//! | `GET /api/sessions/{id}/events` | SSE stream, first frame `connected` |
//! | `DELETE /api/sessions/{id}/events` | retire the session's subscription |
//! | `POST /api/sessions/{id}/messages` | `{text, agentMode?}` |
//! | `POST /api/sessions/{id}/abort` | |
//! | `POST /api/parse` | `{content}` → parsed segments |
//! | `GET /health`, `GET /metrics` | |

#![deny(unsafe_code)]

mod error;
mod handlers;
mod health;
pub mod metrics;
mod server;
mod shutdown;

pub use error::ApiError;
pub use health::{HealthResponse, health_check};
pub use server::{AppState, build_router, serve};
pub use shutdown::ShutdownCoordinator;
