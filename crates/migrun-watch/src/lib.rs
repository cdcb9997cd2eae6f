pub mod api;
pub mod audit;
pub mod config;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{ApiError, HttpJobApi, JobApi};
pub use audit::{AuditPoller, AuditStartError};
pub use config::{ConfigError, ConfigLayer, ReconnectPolicy, SessionConfig};
pub use session::{
    ConnectionState, JobSession, JobSnapshot, ListenerHandle, SessionError, SessionListener,
    SessionUpdate,
};
pub use transport::{PollSession, PushSession, Transport, TransportError, TransportEvent};
