//! # Socket and Listener Management
//!
//! Opaque ownership of TCP/UDP endpoints. The manager owns the listeners
//! it has bound, keyed by port; every stream it returns (accepted or
//! dialed) is owned by the caller. Listening sockets are built through
//! `socket2` so that options and the configured backlog are applied
//! before `listen`, and accepted/dialed streams get their options
//! applied before they are handed out.

use crate::connection::{ConnectionInfo, Protocol};
use crate::error::GatewayError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use socket2::{Domain, SockRef, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Socket options applied to listeners and streams.
///
/// TCP-only options (`no_delay`, `keep_alive`, `backlog`) are ignored
/// for UDP sockets. Timeouts apply to the underlying socket and are
/// mostly relevant to collaborators that move a stream back to blocking
/// mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub no_delay: bool,
    pub keep_alive: bool,
    pub linger_secs: Option<u64>,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub send_timeout_secs: Option<u64>,
    pub recv_timeout_secs: Option<u64>,
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            no_delay: true,
            keep_alive: false,
            linger_secs: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            send_timeout_secs: None,
            recv_timeout_secs: None,
            backlog: 128,
        }
    }
}

/// An owned stream handle, TCP or connected UDP.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Stream {
    pub fn protocol(&self) -> Protocol {
        match self {
            Stream::Tcp(_) => Protocol::Tcp,
            Stream::Udp(_) => Protocol::Udp,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Stream::Tcp(stream) => stream.local_addr(),
            Stream::Udp(socket) => socket.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Stream::Tcp(stream) => stream.peer_addr(),
            Stream::Udp(socket) => socket.peer_addr(),
        }
    }

    /// Orderly write-side shutdown for TCP; a no-op for UDP.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.shutdown().await,
            Stream::Udp(_) => Ok(()),
        }
    }

    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            Stream::Tcp(stream) => Some(stream),
            Stream::Udp(_) => None,
        }
    }
}

#[derive(Debug)]
enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Owns bound listeners; hands out streams.
#[derive(Debug, Default)]
pub struct SocketManager {
    listeners: DashMap<u16, Arc<Listener>>,
}

impl SocketManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener on `address:port`. TCP listeners start listening
    /// with the configured backlog immediately.
    pub fn bind(
        &self,
        port: u16,
        address: IpAddr,
        protocol: Protocol,
        opts: &SocketOptions,
    ) -> Result<(), GatewayError> {
        use dashmap::mapref::entry::Entry;

        let slot = match self.listeners.entry(port) {
            Entry::Occupied(_) => return Err(GatewayError::AlreadyBound(port)),
            Entry::Vacant(slot) => slot,
        };

        let addr = SocketAddr::new(address, port);
        let listener = match protocol {
            Protocol::Tcp => Listener::Tcp(Self::bind_tcp(addr, opts)?),
            Protocol::Udp => Listener::Udp(Self::bind_udp(addr, opts)?),
            other => {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "cannot bind protocol {other}"
                )))
            }
        };

        debug!(%addr, %protocol, "listener bound");
        slot.insert(Arc::new(listener));
        Ok(())
    }

    fn bind_tcp(addr: SocketAddr, opts: &SocketOptions) -> Result<TcpListener, GatewayError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        if opts.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = opts.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = opts.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(&addr.into()).map_err(|err| map_bind_error(err, addr.port()))?;
        socket.listen(opts.backlog as i32)?;
        Ok(TcpListener::from_std(socket.into())?)
    }

    fn bind_udp(addr: SocketAddr, opts: &SocketOptions) -> Result<UdpSocket, GatewayError> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        if opts.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = opts.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = opts.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(&addr.into()).map_err(|err| map_bind_error(err, addr.port()))?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Local address of the listener bound on `port`.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.get(&port).and_then(|listener| match &**listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Udp(s) => s.local_addr().ok(),
        })
    }

    /// Wait for the next inbound TCP stream on `port`, or for
    /// cancellation. The returned stream already has `opts` applied.
    pub async fn accept(
        &self,
        port: u16,
        opts: &SocketOptions,
        cancel: &CancellationToken,
    ) -> Result<(Stream, ConnectionInfo), GatewayError> {
        let listener = self
            .listeners
            .get(&port)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| not_bound(port))?;

        let Listener::Tcp(tcp) = &*listener else {
            return Err(GatewayError::ConfigurationInvalid(format!(
                "accept on port {port} requires a tcp listener"
            )));
        };

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            accepted = tcp.accept() => accepted?,
        };
        debug!(%peer, port, "accepted inbound stream");

        let stream = Stream::Tcp(stream);
        self.apply_options(&stream, opts)?;
        let info = Self::extract_info(&stream, Protocol::Tcp);
        Ok((stream, info))
    }

    /// Dial `destination`. Failures release the partially created socket
    /// before surfacing.
    pub async fn connect(
        &self,
        destination: SocketAddr,
        protocol: Protocol,
        opts: &SocketOptions,
        cancel: &CancellationToken,
    ) -> Result<Stream, GatewayError> {
        let stream = match protocol {
            Protocol::Tcp => {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    dialed = TcpStream::connect(destination) => dialed?,
                };
                Stream::Tcp(stream)
            }
            Protocol::Udp => {
                let bind_addr: SocketAddr = if destination.is_ipv4() {
                    "0.0.0.0:0".parse().expect("constant address")
                } else {
                    "[::]:0".parse().expect("constant address")
                };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(destination).await?;
                Stream::Udp(socket)
            }
            other => {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "cannot dial protocol {other}"
                )))
            }
        };

        self.apply_options(&stream, opts)?;
        debug!(%destination, %protocol, "outbound stream connected");
        Ok(stream)
    }

    /// Close the listener held for `port`. Returns true if one was held.
    pub fn unbind(&self, port: u16) -> bool {
        let removed = self.listeners.remove(&port).is_some();
        if removed {
            debug!(port, "listener unbound");
        }
        removed
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Apply socket options to an existing stream.
    pub fn apply_options(&self, stream: &Stream, opts: &SocketOptions) -> Result<(), GatewayError> {
        match stream {
            Stream::Tcp(tcp) => {
                tcp.set_nodelay(opts.no_delay)?;
                let sock = SockRef::from(tcp);
                sock.set_keepalive(opts.keep_alive)?;
                Self::apply_common(&sock, opts)?;
            }
            Stream::Udp(udp) => {
                let sock = SockRef::from(udp);
                Self::apply_common(&sock, opts)?;
            }
        }
        Ok(())
    }

    fn apply_common(sock: &SockRef<'_>, opts: &SocketOptions) -> std::io::Result<()> {
        if opts.reuse_address {
            sock.set_reuse_address(true)?;
        }
        if let Some(secs) = opts.linger_secs {
            sock.set_linger(Some(Duration::from_secs(secs)))?;
        }
        if let Some(size) = opts.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(size) = opts.recv_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(secs) = opts.send_timeout_secs {
            sock.set_write_timeout(Some(Duration::from_secs(secs)))?;
        }
        if let Some(secs) = opts.recv_timeout_secs {
            sock.set_read_timeout(Some(Duration::from_secs(secs)))?;
        }
        Ok(())
    }

    /// Five-tuple context for a stream: source = remote endpoint,
    /// destination = local endpoint.
    pub fn extract_info(stream: &Stream, protocol: Protocol) -> ConnectionInfo {
        ConnectionInfo::new(stream.peer_addr().ok(), stream.local_addr().ok(), protocol)
    }

    /// Unbind everything held.
    pub fn dispose(&self) {
        let count = self.listeners.len();
        self.listeners.clear();
        if count > 0 {
            warn!(listeners = count, "socket manager disposed");
        }
    }
}

fn map_bind_error(err: std::io::Error, port: u16) -> GatewayError {
    if err.kind() == std::io::ErrorKind::AddrInUse {
        GatewayError::AlreadyBound(port)
    } else {
        GatewayError::Io(err)
    }
}

fn not_bound(port: u16) -> GatewayError {
    GatewayError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("port {port} is not bound"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    /// Bind an ephemeral TCP listener; returns the kernel-chosen port.
    fn bind_ephemeral(manager: &SocketManager) -> u16 {
        manager
            .bind(0, localhost(), Protocol::Tcp, &SocketOptions::default())
            .unwrap();
        // Port 0 keys the map entry; resolve the real port for dialing.
        manager.local_addr(0).unwrap().port()
    }

    #[tokio::test]
    async fn bind_rejects_duplicate_port() {
        let manager = SocketManager::new();
        let port = bind_ephemeral(&manager);

        // Same map key.
        let err = manager
            .bind(0, localhost(), Protocol::Tcp, &SocketOptions::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyBound(0)));

        // Same OS port, different manager.
        let other = SocketManager::new();
        let err = other
            .bind(port, localhost(), Protocol::Tcp, &SocketOptions::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyBound(p) if p == port));
    }

    #[tokio::test]
    async fn accept_and_extract_info() {
        let manager = SocketManager::new();
        let port = bind_ephemeral(&manager);
        let cancel = CancellationToken::new();

        let dial = tokio::spawn(async move {
            TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        });

        let (stream, info) = manager
            .accept(0, &SocketOptions::default(), &cancel)
            .await
            .unwrap();
        let client = dial.await.unwrap();

        assert_eq!(stream.protocol(), Protocol::Tcp);
        assert_eq!(info.protocol, Protocol::Tcp);
        assert_eq!(info.source.unwrap(), client.local_addr().unwrap());
        assert_eq!(info.destination.unwrap().port(), port);
    }

    #[tokio::test]
    async fn accept_surfaces_cancellation() {
        let manager = SocketManager::new();
        bind_ephemeral(&manager);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .accept(0, &SocketOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn accept_requires_bound_tcp_listener() {
        let manager = SocketManager::new();
        let cancel = CancellationToken::new();

        assert!(manager
            .accept(4444, &SocketOptions::default(), &cancel)
            .await
            .is_err());

        manager
            .bind(0, localhost(), Protocol::Udp, &SocketOptions::default())
            .unwrap();
        let err = manager
            .accept(0, &SocketOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationInvalid(_)));
    }

    #[tokio::test]
    async fn connect_tcp_round_trip() {
        let manager = SocketManager::new();
        let port = bind_ephemeral(&manager);
        let cancel = CancellationToken::new();

        let dial_opts = SocketOptions::default();
        let accept_opts = SocketOptions::default();
        let dial = manager.connect(
            SocketAddr::new(localhost(), port),
            Protocol::Tcp,
            &dial_opts,
            &cancel,
        );
        let accept = manager.accept(0, &accept_opts, &cancel);
        let (dialed, accepted) = tokio::join!(dial, accept);

        let mut stream = dialed.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        stream.shutdown().await.unwrap();
        accepted.unwrap();
    }

    #[tokio::test]
    async fn connect_udp_is_connected() {
        let manager = SocketManager::new();
        let cancel = CancellationToken::new();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = server.local_addr().unwrap();

        let stream = manager
            .connect(dest, Protocol::Udp, &SocketOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(stream.protocol(), Protocol::Udp);
        assert_eq!(stream.peer_addr().unwrap(), dest);
    }

    #[tokio::test]
    async fn unbind_releases_the_port() {
        let manager = SocketManager::new();
        let port = bind_ephemeral(&manager);
        assert_eq!(manager.bound_ports(), vec![0]);

        assert!(manager.unbind(0));
        assert!(!manager.unbind(0));
        assert!(manager.bound_ports().is_empty());

        // The OS port is free again.
        let other = SocketManager::new();
        other
            .bind(port, localhost(), Protocol::Tcp, &SocketOptions::default())
            .unwrap();
    }

    #[tokio::test]
    async fn dispose_unbinds_everything() {
        let manager = SocketManager::new();
        bind_ephemeral(&manager);
        manager.dispose();
        assert!(manager.bound_ports().is_empty());
    }
}
