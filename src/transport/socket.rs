//! Non-blocking stream and listener sockets registered with the runtime.
//!
//! Sockets are plain std sockets in non-blocking mode wrapped in
//! [`AsyncFd`]; reads and writes are issued directly and readiness is only
//! used to wake the owning pollable.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::task::{Context, Poll};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tracing::debug;

use super::config::BusConfig;
use super::control::PollControl;
use super::poller::PollSource;

/// Unix-domain socket path on which a TCP server for `port` also listens.
pub fn local_bus_path(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("msgbus-local-{port}.sock"))
}

/// A connected stream socket.
#[derive(Debug)]
pub enum SocketKind {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix-domain connection.
    Unix(UnixStream),
}

impl AsRawFd for SocketKind {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            SocketKind::Tcp(stream) => stream.as_raw_fd(),
            SocketKind::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl AsFd for SocketKind {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            SocketKind::Tcp(stream) => stream.as_fd(),
            SocketKind::Unix(stream) => stream.as_fd(),
        }
    }
}

/// A connected socket armed for readiness.
#[derive(Debug)]
pub struct BusSocket {
    fd: AsyncFd<SocketKind>,
}

impl BusSocket {
    /// Switch `kind` to non-blocking mode and register it with `handle`'s
    /// reactor.
    pub fn new(kind: SocketKind, handle: &Handle) -> io::Result<Self> {
        match &kind {
            SocketKind::Tcp(stream) => stream.set_nonblocking(true)?,
            SocketKind::Unix(stream) => stream.set_nonblocking(true)?,
        }
        let _guard = handle.enter();
        let fd = AsyncFd::with_interest(kind, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { fd })
    }

    /// Read what is available.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.fd.get_ref() {
            SocketKind::Tcp(stream) => Read::read(&mut &*stream, buf),
            SocketKind::Unix(stream) => Read::read(&mut &*stream, buf),
        }
    }

    /// Scatter-gather write.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.fd.get_ref() {
            SocketKind::Tcp(stream) => Write::write_vectored(&mut &*stream, bufs),
            SocketKind::Unix(stream) => Write::write_vectored(&mut &*stream, bufs),
        }
    }

    /// Peer address of TCP sockets.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.fd.get_ref() {
            SocketKind::Tcp(stream) => stream.peer_addr().ok(),
            SocketKind::Unix(_) => None,
        }
    }

    /// Whether this is a unix-domain socket.
    pub fn is_unix(&self) -> bool {
        matches!(self.fd.get_ref(), SocketKind::Unix(_))
    }

    /// Apply TCP options from `config`; no-op for unix sockets.
    pub fn configure(&self, config: &BusConfig) {
        if self.is_unix() {
            return;
        }
        let fd = self.fd.get_ref();
        if config.enable_no_delay {
            log_failure("TCP_NODELAY", rustix::net::sockopt::set_tcp_nodelay(fd, true));
        }
        log_failure("SO_KEEPALIVE", rustix::net::sockopt::set_socket_keepalive(fd, true));
        #[cfg(target_os = "linux")]
        if config.enable_quick_ack {
            log_failure("TCP_QUICKACK", rustix::net::sockopt::set_tcp_quickack(fd, true));
        }
    }

    /// Set the traffic class byte; no-op for unix sockets.
    pub fn set_tos(&self, tos: u8) -> bool {
        if self.is_unix() {
            return true;
        }
        let fd = self.fd.get_ref();
        let v6 = rustix::net::sockopt::set_ipv6_tclass(fd, u32::from(tos));
        let v4 = rustix::net::sockopt::set_ip_tos(fd, tos);
        v6.is_ok() || v4.is_ok()
    }
}

impl PollSource for BusSocket {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: PollControl) -> Poll<io::Result<PollControl>> {
        let mut ready = PollControl::NONE;
        if interest.contains(PollControl::READ) {
            match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(mut guard)) => {
                    guard.clear_ready();
                    ready |= PollControl::READ;
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => {}
            }
        }
        if interest.contains(PollControl::WRITE) {
            match self.fd.poll_write_ready(cx) {
                Poll::Ready(Ok(mut guard)) => {
                    guard.clear_ready();
                    ready |= PollControl::WRITE;
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => {}
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    }
}

/// A listening socket.
#[derive(Debug)]
pub enum ListenerKind {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix-domain listener and its path.
    Unix(UnixListener, PathBuf),
}

impl AsRawFd for ListenerKind {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            ListenerKind::Tcp(listener) => listener.as_raw_fd(),
            ListenerKind::Unix(listener, _) => listener.as_raw_fd(),
        }
    }
}

/// A listening socket armed for readiness.
#[derive(Debug)]
pub struct ListenerSocket {
    fd: AsyncFd<ListenerKind>,
}

impl ListenerSocket {
    /// Bind a TCP listener on all interfaces, dual-stack when IPv6 is
    /// available.
    pub fn bind_tcp(port: u16, backlog: u32, handle: &Handle) -> io::Result<Self> {
        let _guard = handle.enter();
        let listener = match Self::listen_tcp(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), backlog) {
            Ok(listener) => listener,
            Err(error) if is_address_family_unavailable(&error) => {
                Self::listen_tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), backlog)?
            }
            Err(error) => return Err(error),
        };
        listener.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::with_interest(ListenerKind::Tcp(listener), Interest::READABLE)?,
        })
    }

    /// Bind a unix-domain listener.
    pub fn bind_unix(path: &Path, backlog: u32, handle: &Handle) -> io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        rustix::net::listen(&listener, backlog.min(i32::MAX as u32) as i32)?;
        listener.set_nonblocking(true)?;
        let _guard = handle.enter();
        Ok(Self {
            fd: AsyncFd::with_interest(
                ListenerKind::Unix(listener, path.to_path_buf()),
                Interest::READABLE,
            )?,
        })
    }

    /// Bind the local listener of a TCP server, replacing a socket file
    /// left behind by a server that is gone.
    pub fn bind_local(port: u16, backlog: u32, handle: &Handle) -> io::Result<Self> {
        let path = local_bus_path(port);
        if path.exists() && UnixStream::connect(&path).is_err() {
            debug!(path = %path.display(), "Removing stale local socket");
            std::fs::remove_file(&path)?;
        }
        Self::bind_unix(&path, backlog, handle)
    }

    /// Path of a unix-domain listener.
    pub fn unix_path(&self) -> Option<&Path> {
        match self.fd.get_ref() {
            ListenerKind::Tcp(_) => None,
            ListenerKind::Unix(_, path) => Some(path),
        }
    }

    fn listen_tcp(address: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
        let socket = match address {
            SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
            SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        socket.listen(backlog)?.into_std()
    }

    /// Accept one pending connection; `WouldBlock` when none is pending.
    pub fn accept(&self) -> io::Result<(SocketKind, Option<SocketAddr>)> {
        match self.fd.get_ref() {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                Ok((SocketKind::Tcp(stream), Some(peer)))
            }
            ListenerKind::Unix(listener, _) => {
                let (stream, _) = listener.accept()?;
                Ok((SocketKind::Unix(stream), None))
            }
        }
    }

    /// Bound TCP address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.fd.get_ref() {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            ListenerKind::Unix(..) => None,
        }
    }

    /// Human-readable bound address.
    pub fn description(&self) -> String {
        match self.fd.get_ref() {
            ListenerKind::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "tcp://?".to_string(), |addr| format!("tcp://{addr}")),
            ListenerKind::Unix(_, path) => format!("unix://{}", path.display()),
        }
    }
}

impl PollSource for ListenerSocket {
    fn poll_ready(&self, cx: &mut Context<'_>, _interest: PollControl) -> Poll<io::Result<PollControl>> {
        match self.fd.poll_read_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                Poll::Ready(Ok(PollControl::READ))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ListenerSocket {
    fn drop(&mut self) {
        if let ListenerKind::Unix(_, path) = self.fd.get_ref() {
            if let Err(error) = std::fs::remove_file(path) {
                debug!(path = %path.display(), %error, "Failed to remove unix socket path");
            }
        }
    }
}

fn is_address_family_unavailable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
    ) || error.raw_os_error() == Some(rustix::io::Errno::AFNOSUPPORT.raw_os_error())
}

fn log_failure(option: &str, result: rustix::io::Result<()>) {
    if let Err(error) = result {
        debug!(option, %error, "Failed to set socket option");
    }
}
