//! # framecast-server
//!
//! The relay process: accepts observer sockets, fans session output out to
//! subscribers, and exposes the HTTP control surface.

pub mod control;
pub mod health;
pub mod heartbeat;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod ws;

pub use registry::{Connection, ConnectionRegistry};
pub use router::MessageRouter;
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
