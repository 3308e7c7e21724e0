//! # prlens-upstream
//!
//! Everything that talks to the agent runtime.
//!
//! - [`UpstreamConnector`] holds the one long-lived event stream, decodes
//!   native frames with [`FrameDecoder`] and publishes the results to a
//!   [`prlens_router::SessionRouter`]. It reconnects with backoff and gives
//!   up only when the policy is exhausted.
//! - [`AgentControl`] is the send-message / abort surface;
//!   [`OpencodeControl`] implements it over HTTP.

#![deny(unsafe_code)]

mod connector;
mod control;
mod decoder;

pub use connector::{ConnectorState, UpstreamConfig, UpstreamConnector};
pub use control::{AgentControl, OpencodeControl, PromptRequest, SendOutcome};
pub use decoder::{DecodeError, FrameDecoder};
