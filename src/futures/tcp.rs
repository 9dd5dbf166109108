//! Outgoing TCP connections.
//!
//! [open_connection] resolves a host, connects to it without blocking the
//! loop and, if asked to, runs a TLS handshake over the new socket. The result
//! is a [Reader]/[Writer] pair; see [super::stream].
//!
//! # Example
//!
//! Fetch the status line of a web page.
//! ```no_run
//! use tinyloop::open_connection;
//!
//! let status = tinyloop::run(async {
//!     let (mut reader, writer) = open_connection("example.com", 443, true).await?;
//!     writer.write(b"HEAD / HTTP/1.0\r\nHost: example.com\r\n\r\n")?;
//!     let status = reader.readline().await?;
//!     writer.close();
//!     Ok::<_, tinyloop::Error>(status)
//! })
//! .unwrap();
//! ```
use std::{
    future::Future,
    io::{self, ErrorKind},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::Arc,
};

use libc::{AF_INET, AF_INET6, EINPROGRESS, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM};
use log::debug;

use crate::error::Error;

use super::{
    current_loop,
    io::wait_writable,
    sock_addr::CSockAddr,
    stream::{Connection, Reader, Writer},
    tls,
};

fn mk_sock(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = if addr.is_ipv4() { AF_INET } else { AF_INET6 };

    let sock = unsafe { libc::socket(family, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0) };

    if sock == -1 {
        Err(io::Error::last_os_error())?;
    }

    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

/// Connect a non-blocking socket to `addr`, suspending until the connection
/// is established or has failed.
async fn connect(addr: SocketAddr) -> Result<TcpStream, Error> {
    let sock = mk_sock(&addr)?;
    let caddr = CSockAddr::from(addr);

    if unsafe { libc::connect(sock.as_raw_fd(), caddr.as_ptr(), caddr.socklen()) } == -1 {
        let err = io::Error::last_os_error();

        if err.raw_os_error() != Some(EINPROGRESS) {
            return Err(err.into());
        }

        wait_writable(sock.as_raw_fd()).await?;
    }

    let sock = TcpStream::from(sock);

    // A writable socket has finished connecting, but not necessarily
    // successfully.
    if let Some(err) = sock.take_error()? {
        return Err(err.into());
    }

    Ok(sock)
}

/// Open a connection to `host` on `port`, over TLS if `secure` is set.
///
/// Every address `host` resolves to is tried in turn; if none of them can be
/// reached the error for the last one is returned as
/// [Error::Connection], labelled `host:port`. A failed TLS handshake is
/// reported the same way.
///
/// Name resolution uses the system resolver and blocks the loop while it
/// runs.
pub fn open_connection(
    host: &str,
    port: u16,
    secure: bool,
) -> impl Future<Output = Result<(Reader, Writer), Error>> + 'static {
    let host = host.to_owned();

    async move {
        let label = format!("{host}:{port}");
        let event_loop = current_loop()?.downgrade();

        let addrs = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::connection(&label, e))?;

        let mut last_err = None;

        for addr in addrs {
            debug!("connecting to {label} at {addr}");

            let mut sock = match connect(addr).await {
                Ok(sock) => sock,
                Err(Error::Io(e)) => {
                    debug!("connection to {addr} failed: {e}");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let tls = if secure {
                match tls::handshake(&mut sock, &host).await {
                    Ok(tls) => Some(tls),
                    Err(Error::Io(source)) => {
                        return Err(Error::Connection {
                            addr: label,
                            source,
                        })
                    }
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            debug!("connected to {label}");

            return Ok(Connection::split(sock, tls, event_loop, label));
        }

        Err(Error::Connection {
            addr: label,
            source: last_err.unwrap_or_else(|| {
                Arc::new(io::Error::new(
                    ErrorKind::NotFound,
                    "host did not resolve to any address",
                ))
            }),
        })
    }
}
