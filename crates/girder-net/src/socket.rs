//! Non-blocking TCP socket with deadline-driven operations.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use girder_core::clock::Deadline;
use girder_core::io::IoDevice;
use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::addr::{Family, TcpAddrInfo};
use crate::error::{NetError, Result};
use crate::poll::{self, Interest};

/// A TCP socket owning one kernel descriptor, closed on drop.
///
/// The descriptor is non-blocking at all times; every potentially blocking
/// operation takes an absolute deadline and reports expiry as a
/// non-exceptional result (`None` from `accept`, `Ok(0)` from `read`/`write`).
///
/// `read` and `write` take `&self` so a receive loop and a send loop may run
/// concurrently on the same connection; whoever closes the socket must make
/// sure both loops have quiesced first.
pub struct TcpSocket {
    sock: Option<Socket>,
    bound: bool,
    listening: bool,
    connected: bool,
    local_endpoint: Option<SocketAddr>,
    remote_endpoint: Option<SocketAddr>,
}

impl TcpSocket {
    /// Create a non-blocking stream socket for `family`.
    pub fn open(family: Family) -> Result<Self> {
        let domain = match family {
            Family::Ipv4 => Domain::IPV4,
            Family::Ipv6 => Domain::IPV6,
        };
        let sock = Socket::new(domain, Type::STREAM, None)?;
        sock.set_nonblocking(true)?;
        Ok(TcpSocket {
            sock: Some(sock),
            bound: false,
            listening: false,
            connected: false,
            local_endpoint: None,
            remote_endpoint: None,
        })
    }

    fn from_accepted(sock: Socket) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        let local_endpoint = sock.local_addr().ok().and_then(|a| a.as_socket());
        let remote_endpoint = sock.peer_addr().ok().and_then(|a| a.as_socket());
        Ok(TcpSocket {
            sock: Some(sock),
            bound: false,
            listening: false,
            connected: true,
            local_endpoint,
            remote_endpoint,
        })
    }

    fn sock(&self) -> Result<&Socket> {
        self.sock.as_ref().ok_or(NetError::NotOpen)
    }

    fn io_sock(&self) -> io::Result<&Socket> {
        self.sock
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is not open"))
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The locally observed endpoint, available after bind, connect or accept.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint
    }

    /// The remotely observed endpoint, available after connect or accept.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    /// Bind to the first endpoint of `addr`.
    pub fn bind(&mut self, addr: &TcpAddrInfo) -> Result<()> {
        let sock = self.sock()?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.first_endpoint().into())?;
        self.local_endpoint = sock.local_addr().ok().and_then(|a| a.as_socket());
        self.bound = true;
        debug!(endpoint = ?self.local_endpoint, "socket bound");
        Ok(())
    }

    pub fn listen(&mut self, backlog: u32) -> Result<()> {
        if !self.bound {
            return Err(NetError::BadState("listen requires a bound socket"));
        }
        self.sock()?.listen(backlog as i32)?;
        self.listening = true;
        Ok(())
    }

    /// Accept one pending connection, waiting until `deadline`.
    ///
    /// `Ok(None)` means the deadline expired without a connection.
    pub fn accept(&self, deadline: Deadline) -> io::Result<Option<TcpSocket>> {
        let sock = self.io_sock()?;
        let fd = sock.as_raw_fd();
        loop {
            match sock.accept() {
                Ok((accepted, _addr)) => {
                    let socket = TcpSocket::from_accepted(accepted)?;
                    debug!(remote = ?socket.remote_endpoint(), "connection accepted");
                    return Ok(Some(socket));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !poll::wait(fd, Interest::Readable, deadline)? {
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // A connection that died between readiness and accept is not
                // an error of the listener.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Connect to the endpoints of `addr` in resolution order, giving each
    /// attempt the remaining deadline.
    pub fn connect(&mut self, addr: &TcpAddrInfo, deadline: Deadline) -> Result<()> {
        let sock = self.sock()?;
        let fd = sock.as_raw_fd();
        let mut last_error: Option<io::Error> = None;
        for endpoint in addr.endpoints() {
            match sock.connect(&(*endpoint).into()) {
                Ok(()) => {}
                Err(e)
                    if e.raw_os_error() == Some(libc::EINPROGRESS)
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    if !poll::wait(fd, Interest::Writable, deadline)
                        .map_err(NetError::Syscall)?
                    {
                        last_error = Some(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connect deadline expired",
                        ));
                        continue;
                    }
                    if let Some(pending) = sock.take_error()? {
                        last_error = Some(pending);
                        continue;
                    }
                }
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            }
            let local_endpoint = sock.local_addr().ok().and_then(|a| a.as_socket());
            let remote_endpoint = sock.peer_addr().ok().and_then(|a| a.as_socket());
            self.connected = true;
            self.local_endpoint = local_endpoint;
            self.remote_endpoint = remote_endpoint;
            debug!(
                local = ?self.local_endpoint,
                remote = ?self.remote_endpoint,
                "connection established"
            );
            return Ok(());
        }
        Err(NetError::Connect(
            addr.to_string(),
            last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no endpoints attempted")),
        ))
    }

    /// Receive into `buf`. `Ok(0)` means the deadline expired; an orderly
    /// close by the peer is `ConnectionAborted`.
    pub fn read(&self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sock = self.io_sock()?;
        let fd = sock.as_raw_fd();
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes and recv
            // writes at most that many.
            let received = unsafe {
                libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            match received {
                n if n > 0 => return Ok(n as usize),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "peer closed the connection",
                    ));
                }
                _ => {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => {
                            if !poll::wait(fd, Interest::Readable, deadline)? {
                                return Ok(0);
                            }
                        }
                        Some(libc::EINTR) => {}
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    /// Send from `buf`. `Ok(0)` means the deadline expired before any byte
    /// left; partial sends return the count and leave the rest to the caller.
    pub fn write(&self, buf: &[u8], deadline: Deadline) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sock = self.io_sock()?;
        let fd = sock.as_raw_fd();
        loop {
            // MSG_NOSIGNAL keeps a dead peer from raising SIGPIPE; the error
            // return is the interface for that condition.
            // SAFETY: buf is valid for reads of buf.len() bytes.
            let sent = unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if sent >= 0 {
                return Ok(sent as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => {
                    if !poll::wait(fd, Interest::Writable, deadline)? {
                        return Ok(0);
                    }
                }
                Some(libc::EINTR) => {}
                Some(libc::EPIPE) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "peer closed the connection",
                    ));
                }
                _ => return Err(err),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    pub fn close(&mut self) {
        if self.sock.take().is_some() {
            debug!(remote = ?self.remote_endpoint, "socket closed");
        }
        self.bound = false;
        self.listening = false;
        self.connected = false;
    }
}

impl IoDevice for TcpSocket {
    fn read(&self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize> {
        TcpSocket::read(self, buf, deadline)
    }

    fn write(&self, buf: &[u8], deadline: Deadline) -> io::Result<usize> {
        TcpSocket::write(self, buf, deadline)
    }

    fn is_open(&self) -> bool {
        TcpSocket::is_open(self)
    }

    fn close(&mut self) {
        TcpSocket::close(self)
    }
}

/// Convenience: open, bind and listen in one step.
pub fn listen_on(addr: &TcpAddrInfo, backlog: u32) -> Result<TcpSocket> {
    let mut socket = TcpSocket::open(addr.family())?;
    socket.bind(addr)?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Convenience: open and connect in one step.
pub fn connect_to(addr: &TcpAddrInfo, timeout: Duration) -> Result<TcpSocket> {
    let mut socket = TcpSocket::open(addr.family())?;
    socket.connect(addr, Deadline::after(timeout))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Host;

    fn loopback_listener() -> (TcpSocket, TcpAddrInfo) {
        let any_port = TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, 0).unwrap();
        let listener = listen_on(&any_port, 8).unwrap();
        let port = listener.local_endpoint().unwrap().port();
        let addr = TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, port).unwrap();
        (listener, addr)
    }

    #[test]
    fn accept_times_out_without_clients() {
        let (listener, _addr) = loopback_listener();
        let accepted = listener
            .accept(Deadline::after(Duration::from_millis(30)))
            .unwrap();
        assert!(accepted.is_none());
    }

    #[test]
    fn connect_accept_read_write_round_trip() {
        let (listener, addr) = loopback_listener();
        let client = connect_to(&addr, Duration::from_secs(2)).unwrap();
        let server = listener
            .accept(Deadline::after(Duration::from_secs(2)))
            .unwrap()
            .expect("pending connection");

        assert!(client.is_connected());
        assert!(server.is_connected());
        assert_eq!(
            client.remote_endpoint().unwrap(),
            server.local_endpoint().unwrap()
        );

        let deadline = Deadline::after(Duration::from_secs(2));
        let written = client.write(b"ping", deadline).unwrap();
        assert_eq!(written, 4);

        let mut buf = [0u8; 16];
        let read = server.read(&mut buf, deadline).unwrap();
        assert_eq!(&buf[..read], b"ping");
    }

    #[test]
    fn read_reports_deadline_expiry_as_zero() {
        let (listener, addr) = loopback_listener();
        let client = connect_to(&addr, Duration::from_secs(2)).unwrap();
        let _server = listener
            .accept(Deadline::after(Duration::from_secs(2)))
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 8];
        let read = client
            .read(&mut buf, Deadline::after(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn read_reports_peer_close_as_aborted() {
        let (listener, addr) = loopback_listener();
        let client = connect_to(&addr, Duration::from_secs(2)).unwrap();
        let mut server = listener
            .accept(Deadline::after(Duration::from_secs(2)))
            .unwrap()
            .unwrap();
        server.close();
        let mut buf = [0u8; 8];
        let err = client
            .read(&mut buf, Deadline::after(Duration::from_secs(2)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn closed_socket_refuses_io() {
        let (listener, addr) = loopback_listener();
        let mut client = connect_to(&addr, Duration::from_secs(2)).unwrap();
        client.close();
        assert!(!client.is_open());
        let mut buf = [0u8; 4];
        assert!(
            client
                .read(&mut buf, Deadline::expired_now())
                .is_err()
        );
    }

    #[test]
    fn connect_to_unused_port_fails() {
        // A port nothing listens on; connect must fail, not hang.
        let addr = TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, 1).unwrap();
        let result = connect_to(&addr, Duration::from_millis(300));
        assert!(result.is_err());
    }
}
