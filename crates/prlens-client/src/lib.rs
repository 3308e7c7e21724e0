//! # prlens-client
//!
//! How a consumer (re)attaches to its session stream.
//!
//! - [`ConnectionState`] / [`ConnectionSignal`]: the lifecycle
//!   `Disconnected → Connecting → Connected → Reconnecting → Connected | Disconnected`
//!   as a total transition function.
//! - [`EventFeed`]: where events come from, either an in-process
//!   [`prlens_router::SessionRouter`] ([`RouterFeed`]) or the server's SSE
//!   endpoint ([`HttpFeed`]).
//! - [`StreamBuffer`]: streamed text, tool calls and status folded per session.
//! - [`SessionClient`]: one attached session at a time, session switching,
//!   reconnect with backoff and the bounded wait before sending a message.

#![deny(unsafe_code)]

mod buffer;
mod feed;
mod session;
mod state;

pub use buffer::{StreamBuffer, StreamFailure, ToolCall, ToolCallStatus};
pub use feed::{EventFeed, EventStream, HttpFeed, RouterFeed};
pub use session::{ClientError, ClientOptions, SessionClient};
pub use state::{ConnectionSignal, ConnectionState, InvalidTransition};
