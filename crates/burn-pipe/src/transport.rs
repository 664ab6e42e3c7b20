//! Local stream transport for the elevation and embedded channels.
//!
//! Unix builds use a domain socket in the temp directory; other platforms
//! listen on an ephemeral loopback TCP port. Either way the listener name is an
//! opaque string passed to the child on its command line, and every accepted
//! connection must still pass the token handshake.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

use tracing::debug;
use uuid::Uuid;

use crate::error::PipeError;

const TCP_PREFIX: &str = "tcp:";
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Random name component for a listener.
pub fn generate_pipe_name() -> String {
    format!("burn.{}", Uuid::new_v4().simple())
}

/// Random secret the child must present during the handshake.
pub fn generate_secret() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug)]
pub enum PipeStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl PipeStream {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_read_timeout(timeout),
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
        }
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
            Self::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
            Self::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
            Self::Tcp(stream) => stream.flush(),
        }
    }
}

#[derive(Debug)]
enum ListenerKind {
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

#[derive(Debug)]
pub struct PipeListener {
    kind: ListenerKind,
    name: String,
}

impl PipeListener {
    pub fn bind() -> Result<Self, PipeError> {
        Self::bind_named(&generate_pipe_name())
    }

    #[cfg(unix)]
    pub fn bind_named(name: &str) -> Result<Self, PipeError> {
        let path = std::env::temp_dir().join(format!("{name}.sock"));
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        debug!(path = %path.display(), "listening on unix socket");
        Ok(Self {
            name: path.display().to_string(),
            kind: ListenerKind::Unix(listener, path),
        })
    }

    #[cfg(not(unix))]
    pub fn bind_named(_name: &str) -> Result<Self, PipeError> {
        Self::bind_tcp()
    }

    /// Loopback TCP listener, available on every platform.
    pub fn bind_tcp() -> Result<Self, PipeError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let name = format!("{TCP_PREFIX}{}", listener.local_addr()?);
        debug!(%name, "listening on loopback");
        Ok(Self {
            kind: ListenerKind::Tcp(listener),
            name,
        })
    }

    /// The string a child passes to [`connect`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next connection. `poll` runs between attempts so the
    /// caller can give up early, for example when the child process exits.
    pub fn accept_until<E, P>(&self, timeout: Duration, mut poll: P) -> Result<PipeStream, E>
    where
        E: From<PipeError>,
        P: FnMut() -> Result<(), E>,
    {
        let started = Instant::now();
        loop {
            match self.try_accept() {
                Ok(stream) => return Ok(stream),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => return Err(PipeError::Io(err).into()),
            }
            poll()?;
            if started.elapsed() >= timeout {
                return Err(PipeError::Timeout("pipe connection").into());
            }
            thread::sleep(ACCEPT_POLL);
        }
    }

    fn try_accept(&self) -> io::Result<PipeStream> {
        match &self.kind {
            #[cfg(unix)]
            ListenerKind::Unix(listener, _) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok(PipeStream::Unix(stream))
            }
            ListenerKind::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(PipeStream::Tcp(stream))
            }
        }
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenerKind::Unix(_, path) = &self.kind {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Opens a connection to a listener named by [`PipeListener::name`].
pub fn connect(name: &str) -> Result<PipeStream, PipeError> {
    if let Some(address) = name.strip_prefix(TCP_PREFIX) {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        return Ok(PipeStream::Tcp(stream));
    }

    #[cfg(unix)]
    {
        Ok(PipeStream::Unix(UnixStream::connect(PathBuf::from(name))?))
    }
    #[cfg(not(unix))]
    {
        Err(PipeError::Io(io::Error::new(
            ErrorKind::InvalidInput,
            format!("unsupported pipe name '{name}'"),
        )))
    }
}
