//! Buffered duplex byte streams.
//!
//! [crate::open_connection] hands back a [Reader] and a [Writer] sharing one
//! connection. The reader suspends whenever it needs more bytes than the
//! socket has delivered. The writer never suspends: [Writer::write] buffers
//! what the socket does not take right away, and a writable watcher on the
//! loop flushes the rest, re-arming itself until the buffer is empty.
//! [Writer::drain] waits for that to happen.
//!
//! Over TLS the same holds for the encrypted records; the plaintext seen by
//! the reader and the writer is identical to the plain TCP case.
use std::{
    cell::RefCell,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, TcpStream},
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};

use log::{debug, trace};
use rustls::ClientConnection;

use crate::{
    error::Error,
    event_loop::WeakLoop,
    future::Future,
    handle::Handle,
    reactor::Interest,
};

use super::{
    io::wait_readable,
    tls::{invalid_data, write_records},
};

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct Connection {
    sock: TcpStream,
    tls: Option<Box<ClientConnection>>,
    outgoing: Vec<u8>,
    closing: bool,
    closed: bool,
    watcher: Option<Handle>,
    drained: Vec<Future<()>>,
    error: Option<Error>,
    event_loop: WeakLoop,
    peer: String,
}

type Shared = Rc<RefCell<Connection>>;

impl Connection {
    pub(crate) fn split(
        sock: TcpStream,
        tls: Option<ClientConnection>,
        event_loop: WeakLoop,
        peer: String,
    ) -> (Reader, Writer) {
        let fd = sock.as_raw_fd();
        let conn = Rc::new(RefCell::new(Self {
            sock,
            tls: tls.map(Box::new),
            outgoing: Vec::new(),
            closing: false,
            closed: false,
            watcher: None,
            drained: Vec::new(),
            error: None,
            event_loop,
            peer,
        }));

        (
            Reader {
                conn: conn.clone(),
                fd,
                buf: Vec::new(),
                eof: false,
            },
            Writer { conn },
        )
    }

    /// Append whatever the socket has to `buf`. `Ok(None)` means the socket
    /// would block, `Ok(Some(0))` means end of stream.
    fn read_some(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<usize>> {
        let mut chunk = [0u8; READ_CHUNK];

        let Some(tls) = self.tls.as_mut() else {
            loop {
                return match self.sock.read(&mut chunk) {
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        Ok(Some(n))
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
            }
        };

        let mut peer_gone = false;

        loop {
            match tls.reader().read(&mut chunk) {
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    return Ok(Some(n));
                }
                // The peer closed the socket without a close_notify.
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Some(0)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if peer_gone {
                        return Ok(Some(0));
                    }
                }
                Err(e) => return Err(e),
            }

            match tls.read_tls(&mut self.sock) {
                Ok(0) => peer_gone = true,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            tls.process_new_packets().map_err(invalid_data)?;
        }
    }

    fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        match self.tls.as_mut() {
            Some(tls) => tls.writer().write_all(data),
            None => {
                self.outgoing.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Write as much buffered data as the socket accepts.
    fn flush(&mut self) -> io::Result<()> {
        if let Some(tls) = self.tls.as_mut() {
            write_records(tls, &mut self.sock)?;
            return Ok(());
        }

        let mut written = 0;

        while written < self.outgoing.len() {
            match self.sock.write(&self.outgoing[written..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        self.outgoing.drain(..written);

        Ok(())
    }

    fn has_pending(&self) -> bool {
        match self.tls.as_ref() {
            Some(tls) => tls.wants_write(),
            None => !self.outgoing.is_empty(),
        }
    }

    fn fail(&mut self, err: Error) {
        debug!("connection to {} failed: {err}", self.peer);

        for fut in self.drained.drain(..) {
            let _ = fut.set_exception(err.clone());
        }

        self.error = Some(err);
        self.shutdown(Shutdown::Both);
    }

    /// Stop sending. With [Shutdown::Write] the peer sees end of stream while
    /// whatever it still sends can be read.
    fn shutdown(&mut self, how: Shutdown) {
        if self.closed {
            return;
        }

        self.closed = true;
        self.stop_watching();

        if let Err(e) = self.sock.shutdown(how) {
            trace!("shutdown of {} failed: {e}", self.peer);
        }

        debug!("connection to {} closed ({how:?})", self.peer);
    }

    fn stop_watching(&mut self) {
        let Some(handle) = self.watcher.take() else {
            return;
        };

        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_handle(self.sock.as_raw_fd(), Interest::Writable, &handle);
        }
    }

    /// Flush, then either finish pending drains and closes or arm the
    /// writable watcher to try again.
    fn pump(shared: &Shared) {
        let mut conn = shared.borrow_mut();

        if conn.closed {
            return;
        }

        if let Err(e) = conn.flush() {
            conn.fail(e.into());
            return;
        }

        if conn.has_pending() {
            if conn.watcher.is_none() {
                conn.watch(shared);
            }
            return;
        }

        for fut in conn.drained.drain(..) {
            let _ = fut.set_result(());
        }

        if conn.closing {
            conn.shutdown(Shutdown::Write);
        }
    }

    fn watch(&mut self, shared: &Shared) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };

        let weak = Rc::downgrade(shared);
        let res = event_loop.add_writer(self.sock.as_raw_fd(), move || {
            if let Some(shared) = weak.upgrade() {
                shared.borrow_mut().watcher = None;
                Connection::pump(&shared);
            }
        });

        match res {
            Ok(handle) => self.watcher = Some(handle),
            Err(e) => self.fail(e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

/// The reading half of a connection.
pub struct Reader {
    conn: Shared,
    fd: RawFd,
    buf: Vec<u8>,
    eof: bool,
}

impl Reader {
    /// Read more bytes into the buffer, suspending until some arrive.
    async fn fill(&mut self) -> Result<(), Error> {
        loop {
            let res = self.conn.borrow_mut().read_some(&mut self.buf);

            match res {
                Ok(Some(0)) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(Some(_)) => {
                    if self.conn.borrow().has_pending() {
                        Connection::pump(&self.conn);
                    }
                    return Ok(());
                }
                Ok(None) => wait_readable(self.fd).await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read one line, including its trailing `\n`.
    ///
    /// At end of stream the remaining bytes are returned without a newline;
    /// after that every call returns an empty vector.
    pub async fn readline(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                return Ok(self.buf.drain(..=pos).collect());
            }

            if self.eof {
                return Ok(std::mem::take(&mut self.buf));
            }

            self.fill().await?;
        }
    }

    /// Read up to `max` bytes, suspending only if nothing is buffered. An
    /// empty result means end of stream.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        if self.buf.is_empty() && !self.eof && max > 0 {
            self.fill().await?;
        }

        let n = max.min(self.buf.len());

        Ok(self.buf.drain(..n).collect())
    }

    /// `true` once the peer has finished sending and everything received has
    /// been read.
    pub fn at_eof(&self) -> bool {
        self.eof && self.buf.is_empty()
    }
}

/// The writing half of a connection.
pub struct Writer {
    conn: Shared,
}

impl Writer {
    /// Queue `data` for sending. Never suspends.
    ///
    /// Fails with [Error::InvalidState] once the writer is closing, and with
    /// the stored error if an earlier flush failed.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        {
            let mut conn = self.conn.borrow_mut();

            if conn.closing || conn.closed {
                return Err(Error::InvalidState("write to a closed stream"));
            }

            if let Some(e) = &conn.error {
                return Err(e.clone());
            }

            conn.queue(data)?;
        }

        Connection::pump(&self.conn);

        Ok(())
    }

    /// Wait until everything written so far has been handed to the socket.
    pub async fn drain(&self) -> Result<(), Error> {
        let fut = {
            let mut conn = self.conn.borrow_mut();

            if let Some(e) = &conn.error {
                return Err(e.clone());
            }

            if conn.closed || !conn.has_pending() {
                return Ok(());
            }

            let fut = Future::for_one_waiter(conn.event_loop.clone());
            conn.drained.push(fut.clone());
            fut
        };

        fut.await
    }

    /// Close the sending side once the write buffer has drained. Over TLS a
    /// `close_notify` alert is sent first.
    ///
    /// The [Reader] keeps working: it returns whatever the peer still sends
    /// and reports end of stream once the peer closes its side.
    pub fn close(&self) {
        {
            let mut conn = self.conn.borrow_mut();

            if conn.closing || conn.closed {
                return;
            }

            conn.closing = true;

            if let Some(tls) = conn.tls.as_mut() {
                tls.send_close_notify();
            }
        }

        Connection::pump(&self.conn);
    }

    pub fn is_closing(&self) -> bool {
        let conn = self.conn.borrow();
        conn.closing || conn.closed
    }
}
