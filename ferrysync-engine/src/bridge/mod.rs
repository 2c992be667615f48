//! Stream bridge between push-style and pull-style byte streams.
//!
//! Some backend SDKs can only write an object into a sink they are handed,
//! or only read an object from a reader they drain themselves. The bridge
//! runs that call on a dedicated thread and connects it to the caller
//! through a bounded in-memory pipe:
//!
//! - [`StreamBridge::spawn_push`]: the thread runs a producer that writes;
//!   the caller reads through a [`BridgeReader`].
//! - [`StreamBridge::spawn_sink`]: the thread runs a sink that reads; the
//!   caller writes through a [`BridgeWriter`].
//!
//! Closing either end early never deadlocks. Failures on the thread side are
//! surfaced on the caller's next call.

mod pipe;

use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use sha2::{Digest, Sha256};
use tracing::debug;

use pipe::{Pipe, PipeReader, PipeWriter, Pulled};

/// 256 KiB, the default transfer buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Called with the cumulative number of bytes written into a bridge.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("stream producer failed: {0}")]
    ProducerFailed(String),
    #[error("stream sink failed: {0}")]
    SinkFailed(String),
    #[error("checksum is only available after the stream is fully read and closed")]
    ChecksumUnavailable,
}

/// Builder for one bridge. Each bridge owns one thread and one buffer.
pub struct StreamBridge {
    capacity: usize,
    checksum: bool,
    progress: Option<ProgressFn>,
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl StreamBridge {
    /// A capacity of zero is treated as one byte.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, checksum: false, progress: None }
    }

    /// Digest every byte the reader delivers (push direction only).
    pub fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run `producer` on a new thread named `name`, returning the pull end.
    pub fn spawn_push<P>(self, name: &str, producer: P) -> io::Result<BridgeReader>
    where
        P: FnOnce(&mut dyn Write) -> anyhow::Result<()> + Send + 'static,
    {
        let pipe = Pipe::new(self.capacity);
        let thread_pipe = pipe.clone();
        let progress = self.progress;
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut writer = PipeWriter::new(thread_pipe.clone(), progress);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| producer(&mut writer)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(payload) => Some(panic_text(payload.as_ref())),
            };
            match failure {
                Some(msg) if thread_pipe.reader_closed() => {
                    // The write error is the consumer hanging up, not a fault.
                    debug!(error = %msg, "Stream producer stopped after consumer aborted");
                    thread_pipe.close_writer();
                }
                Some(msg) => thread_pipe.fail(BridgeError::ProducerFailed(msg)),
                None => thread_pipe.close_writer(),
            }
        })?;
        Ok(BridgeReader {
            pipe,
            thread: Some(handle),
            hasher: self.checksum.then(Sha256::new),
            digest: None,
            bytes: 0,
            drained: false,
            closed: false,
        })
    }

    /// Run `sink` on a new thread named `name`, returning the push end. The
    /// sink's return value comes back from [`BridgeWriter::finish`].
    pub fn spawn_sink<S, T>(self, name: &str, sink: S) -> io::Result<BridgeWriter<T>>
    where
        S: FnOnce(&mut dyn Read) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pipe = Pipe::new(self.capacity);
        let thread_pipe = pipe.clone();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut reader = PipeReader::new(thread_pipe.clone());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink(&mut reader)));
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(BridgeError::SinkFailed(format!("{e:#}"))),
                Err(payload) => Err(BridgeError::SinkFailed(panic_text(payload.as_ref()))),
            };
            if let Err(e) = &result {
                thread_pipe.fail(e.clone());
            }
            thread_pipe.close_reader();
            result
        })?;
        Ok(BridgeWriter {
            writer: PipeWriter::new(pipe.clone(), self.progress),
            pipe,
            thread: Some(handle),
        })
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}

// ── Pull end ──

/// Consumer end of a push bridge.
pub struct BridgeReader {
    pipe: Arc<Pipe>,
    thread: Option<JoinHandle<()>>,
    hasher: Option<Sha256>,
    digest: Option<String>,
    bytes: u64,
    drained: bool,
    closed: bool,
}

impl BridgeReader {
    /// Bytes delivered to the consumer so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Release the producer and join its thread.
    ///
    /// Closing before end-of-stream aborts the producer; that is not an
    /// error. A producer failure that happened on its own is returned.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        if !self.closed {
            self.closed = true;
            self.pipe.close_reader();
            if let Some(handle) = self.thread.take() {
                // The thread body catches producer panics itself.
                let _ = handle.join();
            }
            if !self.drained {
                debug!(bytes = self.bytes, "Stream consumer aborted before end of stream");
            }
            if let Some(hasher) = self.hasher.take() {
                if self.drained {
                    self.digest = Some(hex::encode(hasher.finalize()));
                }
            }
        }
        match self.pipe.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hex SHA-256 of every byte read. Requires `with_checksum`, a read to
    /// end-of-stream, and `close`.
    pub fn checksum(&self) -> Result<String, BridgeError> {
        match (&self.digest, self.closed) {
            (Some(digest), true) if self.pipe.failure().is_none() => Ok(digest.clone()),
            _ => Err(BridgeError::ChecksumUnavailable),
        }
    }
}

impl Read for BridgeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.closed || self.drained {
            return Ok(0);
        }
        match self.pipe.pull(buf)? {
            Pulled::Bytes(n) => {
                if let Some(hasher) = &mut self.hasher {
                    hasher.update(&buf[..n]);
                }
                self.bytes += n as u64;
                Ok(n)
            }
            Pulled::End => {
                self.drained = true;
                Ok(0)
            }
        }
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "Bridge reader dropped with a failed producer");
        }
    }
}

// ── Push end ──

/// Producer end of a sink bridge.
pub struct BridgeWriter<T: Send + 'static> {
    writer: PipeWriter,
    pipe: Arc<Pipe>,
    thread: Option<JoinHandle<Result<T, BridgeError>>>,
}

impl<T: Send + 'static> BridgeWriter<T> {
    /// Signal end-of-stream, wait for the sink and return its result.
    pub fn finish(mut self) -> Result<T, BridgeError> {
        self.pipe.close_writer();
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(payload)) => Err(BridgeError::SinkFailed(panic_text(payload.as_ref()))),
            None => Err(BridgeError::SinkFailed("sink already joined".to_string())),
        }
    }
}

impl<T: Send + 'static> Write for BridgeWriter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Send + 'static> Drop for BridgeWriter<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            // Dropped without finish: the sink must not commit a truncated
            // stream.
            self.pipe.abort_writer();
            if let Ok(Err(e)) = handle.join() {
                debug!(error = %e, "Sink ended after writer was dropped");
            }
        }
    }
}
