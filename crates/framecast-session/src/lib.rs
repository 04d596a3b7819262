//! # framecast-session
//!
//! Streaming sessions: frame sources, the session state machine, the
//! per-session pacer task, and the manager that both control surfaces share.

pub mod machine;
pub mod manager;
pub mod pacer;
pub mod source;

pub use machine::{plan_rate, Pacing, RatePlan, Session, SessionSink};
pub use manager::{ManagerConfig, SessionManager};
pub use pacer::{Control, SessionHandle};
pub use source::{
    BuiltinResolver, FrameSource, ManifestSource, SourceDescriptor, SourceInfo, SourceResolver,
    SyntheticSource,
};
