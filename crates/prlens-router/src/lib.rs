//! # prlens-router
//!
//! Fans the single upstream event sequence out to one bounded queue per
//! review session.
//!
//! - [`SessionRouter::publish`] never waits: a full queue drops the event
//!   for that subscriber only and bumps its [`Subscription::dropped`] count.
//! - Events are delivered in publish order within a session. `Connected`
//!   goes to every live subscription.
//! - A session has at most one live [`Subscription`]. Subscribing again
//!   retires the previous one.
//! - Dropping a [`Subscription`] releases its slot; [`Subscription::recv`]
//!   returns `None` as soon as the subscription is retired.

#![deny(unsafe_code)]

mod router;
mod subscription;

pub use router::{PublishReport, RouterError, SessionRouter};
pub use subscription::Subscription;

/// Default per-subscription queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
