//! Line-oriented output sinks.
//!
//! The report stream is plain text, one finding or progress line per line.
//! Writes from concurrent units are serialized per line.

use std::io::{self, BufWriter, ErrorKind, Write};
#[cfg(unix)]
use std::net::TcpStream;
#[cfg(unix)]
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;

/// Destination of report lines.
pub trait OutputSink: Send + Sync {
    /// Write one line. `line` carries no trailing newline.
    fn write_line(&self, line: &str) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Whether the client on the other end has gone away. Must not block.
    fn client_dropped(&self) -> bool {
        false
    }
}

/// Zero-timeout check for a vanished peer.
pub trait LivenessProbe: Send + Sync {
    fn peer_closed(&self) -> bool;
}

/// Liveness probe for a TCP client.
///
/// The client sends nothing while a verify runs, so any readable state
/// (EOF, stray input, or a socket error) means it is gone. The probe is a
/// zero-timeout `poll` and leaves the socket's blocking mode alone, so it
/// may run while another thread writes to the same connection.
#[cfg(unix)]
#[derive(Debug)]
pub struct TcpLiveness {
    stream: TcpStream,
}

#[cfg(unix)]
impl TcpLiveness {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[cfg(unix)]
impl LivenessProbe for TcpLiveness {
    fn peer_closed(&self) -> bool {
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(ready) => ready > 0,
            Err(Errno::EINTR) => false,
            Err(_) => true,
        }
    }
}

/// Buffered sink over any writer, with an optional liveness probe.
pub struct StreamSink<W: Write + Send> {
    writer: Mutex<BufWriter<W>>,
    probe: Option<Box<dyn LivenessProbe>>,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            probe: None,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().into_inner().map_err(io::IntoInnerError::into_error)
    }
}

#[cfg(unix)]
impl StreamSink<TcpStream> {
    /// Sink writing to a TCP client and probing that same connection.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let probe = TcpLiveness::new(stream.try_clone()?);
        Ok(Self::new(stream).with_probe(probe))
    }
}

impl<W: Write + Send> OutputSink for StreamSink<W> {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }

    fn client_dropped(&self) -> bool {
        self.probe.as_ref().is_some_and(|probe| probe.peer_closed())
    }
}

/// Sink invoking a callback per line, for embedded hosts.
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(&str) -> io::Result<()> + Send + Sync,
{
    pub const fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> OutputSink for CallbackSink<F>
where
    F: Fn(&str) -> io::Result<()> + Send + Sync,
{
    fn write_line(&self, line: &str) -> io::Result<()> {
        (self.callback)(line)
    }
}

/// In-memory sink that keeps every line. The client can be marked as
/// dropped, after which writes fail with `BrokenPipe`.
#[derive(Debug, Default)]
pub struct CollectSink {
    lines: Mutex<Vec<String>>,
    dropped: AtomicBool,
}

impl CollectSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines starting with `!` that are not progress lines.
    #[must_use]
    pub fn findings(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.starts_with('!') && !line.starts_with("!verifying "))
            .cloned()
            .collect()
    }

    pub fn set_dropped(&self, dropped: bool) {
        self.dropped.store(dropped, Ordering::Release);
    }
}

impl OutputSink for CollectSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "client dropped"));
        }
        self.lines.lock().push(line.to_owned());
        Ok(())
    }

    fn client_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}
