//! # framecast-client
//!
//! A logical connection to a relay that survives transient network failures.
//! Handlers are registered once, before the first connect, and keep firing
//! across reconnects. Delivery across a reconnect is at-most-once.

pub mod client;
pub mod connector;
pub mod error;
pub mod policy;

pub use client::{ClientBuilder, Handler, LinkStats, ReconnectingClient};
pub use connector::{Connector, Transport, WsConnector};
pub use error::ClientError;
pub use policy::{LinkState, ReconnectPolicy};
