//! UDP transport, `SPEC_FULL.md` §4.7.
//!
//! Grounded on `examples/original_source/sipcore/transport_udp.py`: one
//! bound datagram socket, a handler callback invoked per received datagram
//! with `(data, addr)`, and keepalive (empty/whitespace/CRLFCRLF-only)
//! packets filtered before they ever reach parsing.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Receives a raw datagram plus its source address. Implementations hand
/// back zero or more replies, which the loop sends on the same socket.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr, socket: &UdpSocket);
}

/// True for datagrams that exist only to keep a NAT binding alive: empty,
/// all-whitespace, or a bare CRLFCRLF with no start line.
fn is_keepalive(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    let text = String::from_utf8_lossy(data);
    text.trim().is_empty()
}

/// One bound UDP socket plus its receive loop. Mirrors the source's
/// `UDPServer`: `connection_made` logs the bound address once, datagrams are
/// dispatched to `handler`, and `error_received`-equivalent recv errors are
/// logged and do not stop the loop.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(%local_addr, "UDP transport bound");
        Ok(UdpTransport { socket: Arc::new(socket), local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Sends `data` to `to`, logging (not propagating) any transport error —
    /// matching `SPEC_FULL.md` §4.15: a failed send never aborts the caller.
    pub async fn send_to(&self, data: &[u8], to: SocketAddr) {
        if let Err(err) = self.socket.send_to(data, to).await {
            tracing::warn!(%to, error = %err, "failed to send datagram");
        }
    }

    /// Runs the receive loop until `token` is cancelled. Per-datagram errors
    /// (malformed SIP, handler panics aside) are caught at this boundary,
    /// logged, and dropped — the loop itself never exits on them
    /// (`SPEC_FULL.md` §4.15).
    pub async fn run(&self, handler: Arc<dyn DatagramHandler>, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("UDP transport shutting down");
                    break;
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, src)) => {
                            let data = &buf[..len];
                            if is_keepalive(data) {
                                tracing::trace!(%src, "dropping keepalive datagram");
                                continue;
                            }
                            handler.handle_datagram(data, src, &self.socket).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "UDP recv error");
                        }
                    }
                }
            }
        }
    }
}
