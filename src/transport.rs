//! Line-delimited transport over a pair of byte streams.
//!
//! The read side is owned by the reader loop. The write side is shared by
//! every caller and every dispatched reply, so it sits behind an async mutex:
//! one line is written and flushed per lock acquisition, which keeps lines
//! from interleaving.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A full-duplex, line-oriented stream pair.
pub struct Transport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: TransportReader::new(Box::new(reader)),
            writer: TransportWriter::new(Box::new(writer)),
        }
    }

    /// The current process's stdin/stdout (listen mode).
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Read side: yields received lines until the peer closes its output.
pub struct TransportReader {
    inner: BufReader<BoxedRead>,
    buf: Vec<u8>,
}

impl TransportReader {
    fn new(inner: BoxedRead) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream. Invalid UTF-8 is replaced rather
    /// than reported, so a garbled line surfaces as a protocol violation
    /// instead of a read error.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Write side: serialized, newline-terminated writes.
pub struct TransportWriter {
    inner: Mutex<Option<BoxedWrite>>,
}

impl TransportWriter {
    fn new(inner: BoxedWrite) -> Self {
        Self {
            inner: Mutex::new(Some(inner)),
        }
    }

    /// Append `line + "\n"` and flush, atomically with respect to other writers.
    ///
    /// A failed write closes the writer: the stream may hold a partial line,
    /// so nothing else may be written after it. The same holds when this
    /// future is dropped mid-write (a caller's deadline elapsed): the stream
    /// is checked out of the lock while writing and only put back on success.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(mut writer) = guard.take() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport writer is closed",
            ));
        };

        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');

        writer.write_all(&framed).await?;
        writer.flush().await?;
        *guard = Some(writer);
        Ok(())
    }

    /// Shut down the write side so the peer observes end of input.
    ///
    /// Idempotent; later writes fail with `NotConnected`.
    pub async fn close(&self) -> io::Result<()> {
        let writer = self.inner.lock().await.take();
        match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}
