//! Burrow agent - dials out to a burrow relay and serves its tunnels
//!
//! The agent holds a single control connection to the relay. Over it the
//! relay sends tunnel directives (`StartTunnel`/`StopTunnel`) and the
//! multiplexed frames of public requests. Each exchange is forwarded to the
//! tunnel's local TCP target and the answer is streamed back.
//!
//! # Example Usage
//!
//! ```no_run
//! use burrow_agent::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Agent::new(AgentConfig {
//!         relay_addr: "relay.example.com:7000".to_string(),
//!         auth_token: "your-token".to_string(),
//!         ..AgentConfig::default()
//!     })?;
//!
//!     agent.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! 1. **Handshake**: `Hello` with the token, the relay answers `Welcome` or `Rejected`
//! 2. **Heartbeat**: a `Ping` every interval announced by the relay
//! 3. **Directives**: tunnels are acknowledged and remembered for the session
//! 4. **Exchanges**: one task per exchange, bounded inbound queue each
//! 5. **Reconnect**: bounded attempts with a fixed delay; a rejection is final

mod agent;
mod exchanges;
mod forwarder;

pub use agent::{Agent, AgentConfig, AgentError, SessionEnd, TunnelInfo};
pub use exchanges::{Delivery, ExchangeInfo, ExchangeManager, Inbound};
pub use forwarder::{ForwardStats, ForwarderError, TcpForwarder, DEFAULT_CHUNK_SIZE};
