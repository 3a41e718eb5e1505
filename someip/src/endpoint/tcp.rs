//! TCP endpoint: a listener plus a table of live connections, each framed
//! with the SOME/IP length-prefix rule and the magic-cookie resync point
//! the magic-cookie resync handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use someip_proto::{header, MessageType, ReturnCode, ServiceId, SessionId, SomeIpHeader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::endpoint::capability::EndpointCapability;
use crate::error::EndpointError;

/// The fixed magic-cookie PDU used to resync a TCP stream after a framing
/// error: service `0xFFFF`, method `0xFFFF`, client `0xDEAD`, session
/// `0xBEEF`.
fn magic_cookie_request() -> SomeIpHeader {
    SomeIpHeader {
        service: ServiceId(0xFFFF),
        method: someip_proto::MethodId(0xFFFF),
        length: 8,
        client: someip_proto::ClientId(0xDEAD),
        session: SessionId(0xBEEF),
        interface_version: 1,
        message_type: MessageType::Request,
        return_code: ReturnCode::Ok,
    }
}

/// A PDU queued for a connection's writer task, stamped with when it was
/// handed off so the writer can measure total time-in-queue-plus-on-wire
/// against `send_timeout`.
struct Queued {
    enqueued_at: Instant,
    data: Bytes,
}

struct Connection {
    queue_tx: mpsc::Sender<Queued>,
}

pub struct TcpEndpoint {
    local_addr: SocketAddr,
    connections: Mutex<FxHashMap<SocketAddr, Arc<Connection>>>,
    inbound: mpsc::Sender<(SocketAddr, Bytes)>,
    magic_cookies_enabled: bool,
    send_timeout: Duration,
}

impl TcpEndpoint {
    /// Bind a listener and spawn the accept loop. `inbound` receives
    /// `(peer, pdu)` for every fully-framed PDU read off any connection,
    /// including ones this endpoint dialed out itself via [`Self::connect`].
    pub async fn bind(
        addr: SocketAddr,
        inbound: mpsc::Sender<(SocketAddr, Bytes)>,
        magic_cookies_enabled: bool,
        send_timeout: Duration,
    ) -> Result<Arc<Self>, EndpointError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EndpointError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| EndpointError::Bind { addr, source })?;

        let this = Arc::new(Self {
            local_addr,
            connections: Mutex::new(FxHashMap::default()),
            inbound,
            magic_cookies_enabled,
            send_timeout,
        });

        let accept_loop = this.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        accept_loop.clone().adopt(stream, peer).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed, stopping listener");
                        break;
                    }
                }
            }
        });

        Ok(this)
    }

    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(), EndpointError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| EndpointError::Bind { addr, source })?;
        self.clone().adopt(stream, addr).await;
        Ok(())
    }

    async fn adopt(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (queue_tx, queue_rx) = mpsc::channel(256);
        self.connections.lock().await.insert(peer, Arc::new(Connection { queue_tx }));

        let writer = self.clone();
        tokio::spawn(async move {
            writer.write_loop(write_half, queue_rx, peer).await;
            writer.connections.lock().await.remove(&peer);
            debug!(%peer, "tcp send queue drained, connection torn down");
        });

        let reader = self.clone();
        tokio::spawn(async move {
            reader.read_loop(read_half, peer).await;
            reader.connections.lock().await.remove(&peer);
            debug!(%peer, "tcp connection closed");
        });
    }

    /// Drains the send queue in order, escalating from a warning at half
    /// `send_timeout` to tearing the connection down once an entry has sat
    /// unsent (queued or on the wire) for the full `send_timeout`.
    async fn write_loop(&self, mut write_half: tokio::net::tcp::OwnedWriteHalf, mut queue_rx: mpsc::Receiver<Queued>, peer: SocketAddr) {
        let warning_at = self.send_timeout / 2;
        while let Some(item) = queue_rx.recv().await {
            let waited = item.enqueued_at.elapsed();
            if waited >= self.send_timeout {
                warn!(%peer, timeout_ms = self.send_timeout.as_millis() as u64, "tcp send exceeded send_timeout before it could be written, tearing down connection");
                return;
            }
            if waited >= warning_at {
                warn!(%peer, timeout_ms = warning_at.as_millis() as u64, "tcp send has taken longer than half of send_timeout");
            }
            let remaining = self.send_timeout - waited;
            match tokio::time::timeout(remaining, write_half.write_all(&item.data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, "tcp write failed, tearing down connection");
                    return;
                }
                Err(_) => {
                    warn!(%peer, timeout_ms = self.send_timeout.as_millis() as u64, "tcp write exceeded send_timeout, tearing down connection");
                    return;
                }
            }
        }
    }

    async fn read_loop(&self, mut read_half: tokio::net::tcp::OwnedReadHalf, peer: SocketAddr) {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            if buf.capacity() - buf.len() < 4096 {
                buf.reserve(8192);
            }
            let n = match read_half.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    warn!(%peer, error = %e, "tcp read failed");
                    return;
                }
            };
            let _ = n;

            loop {
                let Some(total_len) = header::peek_total_message_len(&buf) else {
                    break;
                };
                if buf.len() < total_len {
                    break;
                }
                let pdu = buf.split_to(total_len).freeze();
                if self.magic_cookies_enabled && is_magic_cookie(&pdu) {
                    warn!(%peer, len = pdu.len(), "discarding magic-cookie resync marker, stream framing was lost");
                    continue;
                }
                if self.inbound.send((peer, pdu)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn is_magic_cookie(pdu: &[u8]) -> bool {
    let cookie = magic_cookie_request();
    let mut expected = BytesMut::new();
    cookie.encode(&mut expected);
    pdu.len() >= expected.len() && pdu[..expected.len()] == expected[..]
}

#[async_trait]
impl EndpointCapability for TcpEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_reliable(&self) -> bool {
        true
    }

    async fn send_to(&self, dst: SocketAddr, data: Bytes) -> Result<(), EndpointError> {
        let conn = {
            let connections = self.connections.lock().await;
            connections.get(&dst).cloned()
        };
        let conn = conn.ok_or(EndpointError::NotBound(dst))?;
        conn.queue_tx
            .send(Queued { enqueued_at: Instant::now(), data })
            .await
            .map_err(|_| EndpointError::NotBound(dst))
    }
}
