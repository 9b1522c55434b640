//! Public HTTP listener
//!
//! Each accepted connection carries one request. The Host header picks the
//! tunnel, the raw request bytes are relayed to the agent unchanged and the
//! agent's response bytes are streamed back as they arrive.

use burrow_control::{RelayCore, RelayError};
use burrow_router::subdomain_from_host;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PublicError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Request too large")]
    TooLarge,
}

/// A request read off a public connection
#[derive(Debug)]
pub struct PublicRequest {
    pub host: String,
    /// Head and body exactly as received
    pub raw: Bytes,
}

/// Accept public connections until `shutdown` fires
pub async fn serve(listener: TcpListener, core: Arc<RelayCore>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &core).await {
                        debug!("Public connection error from {}: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept public connection: {}", e);
            }
        }
    }
    info!("Public listener stopped");
}

/// Serve one public request on `stream`
pub async fn handle_connection<S>(mut stream: S, core: &RelayCore) -> Result<(), PublicError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(PublicError::Io(e)) => return Err(PublicError::Io(e)),
        Err(e) => {
            let status = match e {
                PublicError::TooLarge => (413, "Payload Too Large"),
                _ => (400, "Bad Request"),
            };
            write_status(&mut stream, status).await?;
            return Err(e);
        }
    };

    let Some(subdomain) = subdomain_from_host(&request.host, &core.config().base_domain) else {
        warn!("No tunnel for host: {}", request.host);
        write_status(&mut stream, (404, "Not Found")).await?;
        return Ok(());
    };
    debug!("Public request for subdomain: {}", subdomain);

    let mut exchange = match core.forward(&subdomain, request.raw).await {
        Ok(exchange) => exchange,
        Err(e) => {
            debug!(subdomain = %subdomain, error = %e, "Request not relayed");
            write_status(&mut stream, status_for(&e)).await?;
            return Ok(());
        }
    };

    let mut responded = false;
    while let Some(chunk) = exchange.next_chunk().await {
        match chunk {
            Ok(bytes) => {
                stream.write_all(&bytes).await?;
                responded = true;
            }
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "Exchange failed");
                // Mid-response failures can only be signalled by closing
                if !responded {
                    write_status(&mut stream, status_for(&e)).await?;
                }
                break;
            }
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

/// Read one request head plus its `Content-Length` body.
///
/// Returns `None` when the peer closes before sending anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<PublicRequest>, PublicError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);
    let head_len = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(PublicError::TooLarge);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PublicError::BadRequest(
                "connection closed inside the header".to_string(),
            ));
        }
    };

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| PublicError::BadRequest("header is not valid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");
    if lines.next().map_or(true, |line| line.trim().is_empty()) {
        return Err(PublicError::BadRequest("empty request line".to_string()));
    }

    let mut host = None;
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| PublicError::BadRequest(format!("bad Content-Length '{}'", value)))?;
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(PublicError::BadRequest(
                "chunked request bodies are not supported".to_string(),
            ));
        }
    }
    let host = host.ok_or_else(|| PublicError::BadRequest("missing Host header".to_string()))?;
    if content_length > MAX_BODY_SIZE {
        return Err(PublicError::TooLarge);
    }

    let total = head_len + content_length;
    while buf.len() < total {
        buf.reserve(total - buf.len());
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(PublicError::BadRequest(
                "connection closed inside the body".to_string(),
            ));
        }
    }
    buf.truncate(total);

    Ok(Some(PublicRequest {
        host,
        raw: buf.freeze(),
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// HTTP status reported for a request the relay could not serve
pub fn status_for(err: &RelayError) -> (u16, &'static str) {
    match err {
        RelayError::UnknownSubdomain(_) | RelayError::NotFound { .. } => (404, "Not Found"),
        RelayError::TunnelNotActive(_) | RelayError::AgentOffline(_) | RelayError::AgentBusy(_) => {
            (503, "Service Unavailable")
        }
        RelayError::RelayTimeout => (504, "Gateway Timeout"),
        _ => (502, "Bad Gateway"),
    }
}

async fn write_status<W>(writer: &mut W, (code, reason): (u16, &str)) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        reason.len(),
        reason
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}
