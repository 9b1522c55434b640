use burrow_proto::{ExchangeId, LocalTarget};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Request traffic the relay sent for one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    End,
}

/// Information about an exchange being forwarded to a local target
#[derive(Debug, Clone)]
pub struct ExchangeInfo {
    pub exchange_id: ExchangeId,
    pub tunnel_id: String,
    pub target: LocalTarget,
    pub established_at: Instant,
}

/// What happened to a frame handed to [`ExchangeManager::deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No such exchange (already finished or never opened)
    Unknown,
    /// The forwarder fell behind; the exchange was dropped
    Overflowed,
}

struct Entry {
    info: ExchangeInfo,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
}

impl Entry {
    fn stop(self) {
        self.cancel.cancel();
    }
}

/// Exchanges in flight on the current relay connection.
///
/// Each exchange owns a bounded queue feeding its forwarder task and a
/// token that stops the forwarder, even after the request was fully
/// delivered.
#[derive(Clone)]
pub struct ExchangeManager {
    entries: Arc<DashMap<ExchangeId, Entry>>,
    buffer: usize,
}

impl ExchangeManager {
    pub fn new(buffer: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register an exchange; returns the queue its forwarder reads from and
    /// the token cancelled when the exchange is dropped
    pub fn register(
        &self,
        exchange_id: ExchangeId,
        tunnel_id: &str,
        target: LocalTarget,
    ) -> (mpsc::Receiver<Inbound>, CancellationToken) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();
        let info = ExchangeInfo {
            exchange_id,
            tunnel_id: tunnel_id.to_string(),
            target,
            established_at: Instant::now(),
        };
        tracing::debug!(
            exchange_id,
            tunnel_id = %info.tunnel_id,
            target = %info.target,
            "Registering exchange"
        );
        let entry = Entry {
            info,
            inbound: tx,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.entries.insert(exchange_id, entry) {
            previous.stop();
        }
        (rx, cancel)
    }

    /// Queue request traffic for an exchange without waiting
    pub fn deliver(&self, exchange_id: ExchangeId, item: Inbound) -> Delivery {
        let result = match self.entries.get(&exchange_id) {
            Some(entry) => entry.inbound.try_send(item),
            None => return Delivery::Unknown,
        };
        match result {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                if let Some((_, entry)) = self.entries.remove(&exchange_id) {
                    entry.stop();
                }
                Delivery::Overflowed
            }
            // Forwarder already finished
            Err(TrySendError::Closed(_)) => {
                self.entries.remove(&exchange_id);
                Delivery::Unknown
            }
        }
    }

    pub fn unregister(&self, exchange_id: ExchangeId) {
        if let Some((_, entry)) = self.entries.remove(&exchange_id) {
            tracing::debug!(
                exchange_id,
                tunnel_id = %entry.info.tunnel_id,
                duration_ms = entry.info.established_at.elapsed().as_millis() as u64,
                active_exchanges = self.entries.len(),
                "Exchange finished"
            );
        }
    }

    /// Drop an exchange and stop its forwarder. Returns whether it existed.
    pub fn cancel(&self, exchange_id: ExchangeId) -> bool {
        match self.entries.remove(&exchange_id) {
            Some((_, entry)) => {
                entry.stop();
                true
            }
            None => false,
        }
    }

    /// Cancel every exchange of a tunnel
    pub fn cancel_tunnel(&self, tunnel_id: &str) -> usize {
        let ids: Vec<ExchangeId> = self
            .entries
            .iter()
            .filter(|e| e.info.tunnel_id == tunnel_id)
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn get(&self, exchange_id: ExchangeId) -> Option<ExchangeInfo> {
        self.entries.get(&exchange_id).map(|e| e.info.clone())
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn list(&self) -> Vec<ExchangeInfo> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    /// Cancel everything (connection lost or shutting down)
    pub fn clear(&self) {
        let ids: Vec<ExchangeId> = self.entries.iter().map(|e| *e.key()).collect();
        let count = ids.into_iter().filter(|id| self.cancel(*id)).count();
        if count > 0 {
            tracing::info!(cancelled_exchanges = count, "All exchanges cancelled");
        }
    }
}

impl Default for ExchangeManager {
    fn default() -> Self {
        Self::new(64)
    }
}
