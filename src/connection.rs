//! Line-oriented channels between the module and its profiler children.
//!
//! Each perf scripter connects back over a unix socket whose path it
//! learns from the `PERFWEAVE_CONNECT` environment entry. An [`Acceptor`]
//! owns one bound socket and hands out a [`Connection`] once the scripter
//! dials in; messages are newline-delimited and the stream ends with the
//! `<STOP>` sentinel.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Message terminating a stream (and the filter handshake).
pub const STOP_SENTINEL: &str = "<STOP>";

/// How long one accept attempt waits before reporting a timeout.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum AcceptError {
    /// No peer dialed in within the allotted wait.
    Timeout,
    Io(std::io::Error),
}

impl std::fmt::Display for AcceptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptError::Timeout => write!(f, "timed out waiting for a profiler connection"),
            AcceptError::Io(e) => write!(f, "accept failed: {}", e),
        }
    }
}

impl std::error::Error for AcceptError {}

/// A bound unix socket waiting for one profiler connection.
pub struct Acceptor {
    listener: UnixListener,
    path: PathBuf,
}

impl Acceptor {
    /// Bind a socket at `dir/<tag>.sock`, replacing any stale socket file.
    pub fn bind(dir: &Path, tag: &str) -> Result<Self> {
        let path = dir.join(format!("{}.sock", tag));
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("binding socket {}", path.display()))?;
        listener.set_nonblocking(true)?;
        Ok(Acceptor { listener, path })
    }

    /// Connection instructions for the peer: the socket path.
    pub fn instructions(&self) -> String {
        self.path.display().to_string()
    }

    /// Wait up to `timeout` for a peer, polling the non-blocking listener.
    pub fn accept(&self, timeout: Duration, read_buf_size: usize) -> Result<Connection, AcceptError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    return Connection::new(stream, read_buf_size).map_err(AcceptError::Io);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(AcceptError::Timeout);
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(AcceptError::Io(e)),
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One established bidirectional message channel.
pub struct Connection {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
}

impl Connection {
    fn new(stream: UnixStream, read_buf_size: usize) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Connection {
            reader: BufReader::with_capacity(read_buf_size.max(1), stream),
            writer,
        })
    }

    /// Wrap an already-connected stream (tests and in-process peers).
    pub fn from_stream(stream: UnixStream, read_buf_size: usize) -> std::io::Result<Self> {
        Connection::new(stream, read_buf_size)
    }

    /// Read one message, without its trailing newline.
    /// Returns `None` when the peer closed the stream.
    pub fn read_message(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Write one message followed by a newline, optionally flushing.
    pub fn write_message(&mut self, msg: &str, flush: bool) -> std::io::Result<()> {
        self.writer.write_all(msg.as_bytes())?;
        self.writer.write_all(b"\n")?;
        if flush {
            self.writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_accept_times_out_without_peer() {
        let dir = tempfile::tempdir().unwrap();
        let acceptor = Acceptor::bind(dir.path(), "t0").unwrap();
        let start = Instant::now();
        match acceptor.accept(Duration::from_millis(120), 1024) {
            Err(AcceptError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_message_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let acceptor = Acceptor::bind(dir.path(), "t1").unwrap();
        let path = PathBuf::from(acceptor.instructions());

        let peer = std::thread::spawn(move || {
            let stream = UnixStream::connect(&path).unwrap();
            let mut conn = Connection::from_stream(stream, 1024).unwrap();
            conn.write_message("{\"type\":\"sample\"}", true).unwrap();
            conn.write_message(STOP_SENTINEL, true).unwrap();
            conn.read_message().unwrap()
        });

        let mut conn = acceptor.accept(ACCEPT_TIMEOUT, 1024).unwrap();
        assert_eq!(
            conn.read_message().unwrap().as_deref(),
            Some("{\"type\":\"sample\"}")
        );
        assert_eq!(conn.read_message().unwrap().as_deref(), Some(STOP_SENTINEL));
        conn.write_message("ack", true).unwrap();

        assert_eq!(peer.join().unwrap().as_deref(), Some("ack"));
    }

    #[test]
    fn test_eof_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let acceptor = Acceptor::bind(dir.path(), "t2").unwrap();
        let path = PathBuf::from(acceptor.instructions());

        let peer = std::thread::spawn(move || {
            let _stream = UnixStream::connect(&path).unwrap();
            // drop immediately
        });

        let mut conn = acceptor.accept(ACCEPT_TIMEOUT, 1024).unwrap();
        peer.join().unwrap();
        assert!(conn.read_message().unwrap().is_none());
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _first = Acceptor::bind(dir.path(), "t3").unwrap();
        }
        // Leave a stale file behind manually and rebind over it.
        std::fs::write(dir.path().join("t3.sock"), b"").unwrap();
        assert!(Acceptor::bind(dir.path(), "t3").is_ok());
    }
}
