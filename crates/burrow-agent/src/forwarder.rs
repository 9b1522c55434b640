use crate::exchanges::Inbound;
use burrow_proto::{ExchangeId, LocalTarget, RelayFrame, RelayMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default size of the `Data` frames sent back to the relay
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Errors that can occur while forwarding an exchange
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to local target {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Exchange cancelled by relay")]
    Cancelled,

    #[error("Relay connection closed")]
    RelayClosed,
}

/// Bytes moved by one exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub bytes_to_target: u64,
    pub bytes_to_relay: u64,
}

/// Forwards exchanges to local TCP targets
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    chunk_size: usize,
}

impl TcpForwarder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Forward one exchange between the relay and `target`.
    ///
    /// Request traffic arrives on `inbound`; `Inbound::End` half-closes the
    /// target connection. Everything the target answers is sent back as
    /// `Data` frames followed by `End` once the target closes its side.
    /// If `cancelled` fires, or `inbound` closes without `End`, the exchange
    /// is abandoned and nothing more is sent.
    pub async fn forward(
        &self,
        exchange_id: ExchangeId,
        tunnel_id: &str,
        target: &LocalTarget,
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<RelayMessage>,
        cancelled: CancellationToken,
    ) -> Result<ForwardStats, ForwarderError> {
        tokio::select! {
            _ = cancelled.cancelled() => Err(ForwarderError::Cancelled),
            result = self.pipe(exchange_id, tunnel_id, target, inbound, outbound) => result,
        }
    }

    async fn pipe(
        &self,
        exchange_id: ExchangeId,
        tunnel_id: &str,
        target: &LocalTarget,
        mut inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<RelayMessage>,
    ) -> Result<ForwardStats, ForwarderError> {
        let address = target.to_string();
        let stream =
            TcpStream::connect(&address)
                .await
                .map_err(|e| ForwarderError::ConnectionFailed {
                    address: address.clone(),
                    source: e,
                })?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(
            exchange_id,
            tunnel_id = %tunnel_id,
            target = %address,
            "Connected to local target"
        );

        let (mut target_read, mut target_write) = stream.into_split();
        let written = AtomicU64::new(0);

        let to_target = async {
            while let Some(item) = inbound.recv().await {
                match item {
                    Inbound::Data(bytes) => {
                        target_write.write_all(&bytes).await?;
                        written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    }
                    Inbound::End => {
                        let _ = target_write.shutdown().await;
                        return Ok(true);
                    }
                }
            }
            Ok::<bool, ForwarderError>(false)
        };

        let chunk_size = self.chunk_size;
        let to_relay = async {
            let mut total = 0u64;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = target_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let frame = RelayFrame::data(exchange_id, tunnel_id, buf[..n].to_vec());
                outbound
                    .send(RelayMessage::Frame(frame))
                    .await
                    .map_err(|_| ForwarderError::RelayClosed)?;
                total += n as u64;
            }
            outbound
                .send(RelayMessage::Frame(RelayFrame::end(exchange_id, tunnel_id)))
                .await
                .map_err(|_| ForwarderError::RelayClosed)?;
            Ok::<u64, ForwarderError>(total)
        };
        tokio::pin!(to_relay);

        // The target may answer before the whole request was written
        let bytes_to_relay = tokio::select! {
            sent = &mut to_relay => sent?,
            finished = to_target => {
                if !finished? {
                    return Err(ForwarderError::Cancelled);
                }
                (&mut to_relay).await?
            }
        };

        Ok(ForwardStats {
            bytes_to_target: written.load(Ordering::Relaxed),
            bytes_to_relay,
        })
    }
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::FrameType;
    use tokio::net::TcpListener;

    async fn echo_server() -> LocalTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        LocalTarget::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_forward_echoes_request() {
        let target = echo_server().await;
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        in_tx.send(Inbound::Data(b"hello ".to_vec())).await.unwrap();
        in_tx.send(Inbound::Data(b"world".to_vec())).await.unwrap();
        in_tx.send(Inbound::End).await.unwrap();

        let stats = TcpForwarder::new()
            .forward(9, "tun-1", &target, in_rx, out_tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.bytes_to_target, 11);
        assert_eq!(stats.bytes_to_relay, 11);

        let mut echoed = Vec::new();
        while let Some(RelayMessage::Frame(frame)) = out_rx.recv().await {
            assert_eq!(frame.exchange_id, 9);
            match frame.frame_type {
                FrameType::Data => echoed.extend_from_slice(&frame.payload),
                FrameType::End => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(echoed, b"hello world");
    }

    #[tokio::test]
    async fn test_forward_cancelled() {
        let target = echo_server().await;
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);

        in_tx.send(Inbound::Data(b"partial".to_vec())).await.unwrap();
        drop(in_tx);

        let err = TcpForwarder::new()
            .forward(1, "tun-1", &target, in_rx, out_tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwarderError::Cancelled));
    }

    #[tokio::test]
    async fn test_forward_stops_when_token_fires() {
        let target = echo_server().await;
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let cancelled = CancellationToken::new();

        // Request fully delivered, response never finishes
        in_tx.send(Inbound::Data(b"partial".to_vec())).await.unwrap();
        let forward = {
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                TcpForwarder::new()
                    .forward(1, "tun-1", &target, in_rx, out_tx, cancelled)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancelled.cancel();

        let err = forward.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwarderError::Cancelled));
        drop(in_tx);
    }

    #[tokio::test]
    async fn test_forward_unreachable_target() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let err = TcpForwarder::new()
            .forward(
                1,
                "tun-1",
                &LocalTarget::new("127.0.0.1", port),
                in_rx,
                out_tx,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForwarderError::ConnectionFailed { .. }));
    }
}
