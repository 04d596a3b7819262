//! # framecast-core
//!
//! Shared vocabulary for the framecast relay:
//!
//! - **Branded IDs**: `ConnectionId`, `SessionId` newtypes
//! - **Session enums**: `SessionState`, `SessionMode`
//! - **Wire messages**: `ServerMessage` (outbound) and `ClientEnvelope` / `Inbound` (inbound)
//! - **Errors**: `RelayError` taxonomy via `thiserror`
//! - **Config**: `RelayConfig` loaded with `figment`

pub mod config;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod session;

pub use config::{ConfigError, RelayConfig};
pub use errors::RelayError;
pub use ids::{ConnectionId, SessionId};
pub use messages::{ClientEnvelope, Inbound, MalformedMessage, ServerMessage, StartRequest, StatusKind};
pub use session::{SessionMode, SessionSnapshot, SessionState};
