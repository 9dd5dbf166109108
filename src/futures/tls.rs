//! TLS client support on top of a non-blocking socket.
//!
//! The protocol itself is rustls's business. This module only builds the
//! client configuration (ring crypto, the Mozilla root set from
//! `webpki-roots`) and drives the handshake, turning every point where the
//! socket would block into a readiness wait.
use std::{
    io::{self, ErrorKind},
    net::TcpStream,
    os::fd::AsRawFd,
    sync::{Arc, OnceLock},
};

use log::debug;
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore};

use crate::error::Error;

use super::io::{wait_readable, wait_writable};

static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn client_config() -> Result<Arc<ClientConfig>, Error> {
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(io::Error::other)?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

pub(crate) fn invalid_data(e: rustls::Error) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, e)
}

/// Write out whatever TLS records are queued. Returns `false` if the socket
/// would block before everything was written.
pub(crate) fn write_records(tls: &mut ClientConnection, sock: &mut TcpStream) -> io::Result<bool> {
    while tls.wants_write() {
        match tls.write_tls(sock) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// Run a client handshake for `host` over `sock`.
pub(crate) async fn handshake(sock: &mut TcpStream, host: &str) -> Result<ClientConnection, Error> {
    let fd = sock.as_raw_fd();
    let name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    let mut tls = ClientConnection::new(client_config()?, name).map_err(io::Error::other)?;

    debug!("starting TLS handshake with {host}");

    while tls.is_handshaking() {
        if !write_records(&mut tls, sock)? {
            wait_writable(fd).await?;
            continue;
        }

        match tls.read_tls(sock) {
            Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
            Ok(_) => {
                tls.process_new_packets().map_err(invalid_data)?;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => wait_readable(fd).await?,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    while !write_records(&mut tls, sock)? {
        wait_writable(fd).await?;
    }

    // Writes are buffered by the stream, which flushes them as the socket
    // allows.
    tls.set_buffer_limit(None);

    debug!("TLS handshake with {host} complete");

    Ok(tls)
}
