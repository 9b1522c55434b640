//! Relay core: agent connections, tunnel lifecycle and exchange multiplexing
pub mod agent_registry;
pub mod config;
pub mod error;
pub mod event_log;
pub mod heartbeat;
pub mod lifecycle;
pub mod link;
pub mod model;
pub mod multiplexer;
pub mod quota;
pub mod relay_core;
pub mod session;

pub use agent_registry::{Admission, AgentRegistry};
pub use config::{HeartbeatPolicy, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use event_log::{EventLog, LogEntry, LogLevel};
pub use heartbeat::HeartbeatMonitor;
pub use lifecycle::TunnelLifecycle;
pub use link::AgentLink;
pub use model::{
    AgentId, AgentRecord, AgentState, AgentStats, AgentStatus, CoreEvent, OwnerId, TunnelId,
    TunnelState, TunnelStats, TunnelStatus,
};
pub use multiplexer::{ExchangeStream, RelayMultiplexer};
pub use quota::{QuotaChecker, UnlimitedQuota};
pub use relay_core::RelayCore;
pub use session::{serve_agent_connection, SessionError};
