//! Session transport
//!
//! One attach owns one [`Connection`]. Frames are length-delimited:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  4 bytes: u32 big-endian length      │
//! ├──────────────────────────────────────┤
//! │  N bytes: message                    │
//! └──────────────────────────────────────┘
//! ```
//!
//! The agent side is blocking: it runs on the host's attach thread and, for
//! the deferred path, on whatever thread the host later calls back on. Only
//! the connect step uses a throwaway current-thread runtime so the connect
//! timeout is bounded without spawning workers.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A bound, bidirectional frame channel
pub trait Connection: Send {
    /// Read one whole frame
    fn read_frame(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Write one whole frame
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Opens the connection for one attach
pub trait Connector {
    /// Connect to the controller
    fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// [`Connection`] over any blocking byte stream
#[derive(Debug)]
pub struct StreamConnection<S> {
    stream: S,
}

impl<S> StreamConnection<S> {
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Give back the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + Send> Connection for StreamConnection<S> {
    fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(eof_as_closed)?;
        let len = checked_len(u32::from_be_bytes(len_buf))?;
        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).map_err(eof_as_closed)?;
        Ok(frame)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let len = encode_len(frame.len())?;
        self.stream.write_all(&len)?;
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Read one frame from an async stream (controller side)
///
/// # Errors
/// Returns [`TransportError::Closed`] if the peer hangs up before a whole
/// frame arrives.
pub async fn read_frame_async<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;
    let len = checked_len(u32::from_be_bytes(len_buf))?;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await.map_err(eof_as_closed)?;
    Ok(frame)
}

/// Write one frame to an async stream (controller side)
///
/// # Errors
/// Returns the I/O error, or [`TransportError::FrameTooLarge`]
pub async fn write_frame_async<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = encode_len(frame.len())?;
    writer.write_all(&len).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

fn checked_len(len: u32) -> Result<usize, TransportError> {
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

fn encode_len(len: usize) -> Result<[u8; 4], TransportError> {
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }
    // MAX_FRAME_LEN fits in u32.
    Ok((len as u32).to_be_bytes())
}

fn eof_as_closed(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

/// Connects to the controller's Unix-domain socket
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
    timeout: Duration,
}

#[cfg(unix)]
impl UnixConnector {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

#[cfg(unix)]
impl Connector for UnixConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        // block_on panics inside a runtime; the host attach thread has none.
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(TransportError::NestedRuntime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;

        let stream = runtime.block_on(async {
            let connected =
                tokio::time::timeout(self.timeout, tokio::net::UnixStream::connect(&self.path))
                    .await
                    .map_err(|_| TransportError::Timeout {
                        path: self.path.clone(),
                        timeout: self.timeout,
                    })?
                    .map_err(|source| TransportError::Connect {
                        path: self.path.clone(),
                        source,
                    })?;
            let std_stream = connected.into_std()?;
            std_stream.set_nonblocking(false)?;
            Ok::<_, TransportError>(std_stream)
        })?;

        tracing::debug!(path = %self.path.display(), "connected to controller");
        Ok(Box::new(StreamConnection::new(stream)))
    }
}

/// Transport failures; none of them leave room for a response
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the controller
    #[error("cannot connect to {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },

    /// Controller did not accept within the connect timeout
    #[error("connect to {} timed out after {timeout:?}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    /// Read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame exceeds [`MAX_FRAME_LEN`]
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer closed the connection mid-frame or before one arrived
    #[error("connection closed by peer")]
    Closed,

    /// Blocking connect attempted from inside an async runtime
    #[error("blocking connect called from inside an async runtime")]
    NestedRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, appends writes to `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            Read::read(&mut self.input, buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Write::write(&mut self.output, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_exactly_one_frame() {
        let mut input = framed(b"first");
        input.extend(framed(b"second"));
        let mut conn = StreamConnection::new(Duplex {
            input: Cursor::new(input),
            output: Vec::new(),
        });
        assert_eq!(conn.read_frame().unwrap(), b"first");
        assert_eq!(conn.read_frame().unwrap(), b"second");
        assert!(matches!(conn.read_frame(), Err(TransportError::Closed)));
    }

    #[test]
    fn writes_length_prefix() {
        let mut conn = StreamConnection::new(Duplex {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        });
        conn.write_frame(b"abc").unwrap();
        assert_eq!(conn.into_inner().output, framed(b"abc"));
    }

    #[test]
    fn truncated_frame_is_closed() {
        let mut input = framed(b"complete");
        input.truncate(6);
        let mut conn = StreamConnection::new(Duplex {
            input: Cursor::new(input),
            output: Vec::new(),
        });
        assert!(matches!(conn.read_frame(), Err(TransportError::Closed)));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let input = u32::MAX.to_be_bytes().to_vec();
        let mut conn = StreamConnection::new(Duplex {
            input: Cursor::new(input),
            output: Vec::new(),
        });
        assert!(matches!(
            conn.read_frame(),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn async_helpers_interoperate_with_blocking_side() {
        let mut wire = Vec::new();
        write_frame_async(&mut wire, b"hello").await.unwrap();
        assert_eq!(wire, framed(b"hello"));

        let mut reader = wire.as_slice();
        assert_eq!(read_frame_async(&mut reader).await.unwrap(), b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn unix_connector_times_out_or_fails_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let connector = UnixConnector::new(dir.path().join("absent.sock"), Duration::from_millis(200));
        let err = connector.connect().err().unwrap();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_connector_refuses_inside_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let err = UnixConnector::new(&path, Duration::from_secs(1)).connect().err().unwrap();
        assert!(matches!(err, TransportError::NestedRuntime));
    }

    #[cfg(unix)]
    #[test]
    fn unix_connector_talks_to_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let mut conn = UnixConnector::new(&path, Duration::from_secs(1)).connect().unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut controller = StreamConnection::new(accepted);

        controller.write_frame(b"request").unwrap();
        assert_eq!(conn.read_frame().unwrap(), b"request");
        conn.write_frame(b"response").unwrap();
        assert_eq!(controller.read_frame().unwrap(), b"response");
    }
}
