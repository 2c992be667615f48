use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{BridgeError, ProgressFn};

/// Outcome of one attempt to pull bytes out of the pipe.
pub(super) enum Pulled {
    Bytes(usize),
    /// Writer finished and every byte has been consumed.
    End,
}

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    writer_aborted: bool,
    reader_closed: bool,
    failure: Option<BridgeError>,
}

/// Fixed-capacity byte ring buffer shared by exactly one writer and one
/// reader, each on its own thread.
pub(super) struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
}

impl Pipe {
    pub(super) fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            state: Mutex::new(PipeState {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                writer_closed: false,
                writer_aborted: false,
                reader_closed: false,
                failure: None,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy as much of `data` as fits, waiting while the buffer is full.
    pub(super) fn push(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock();
        loop {
            if let Some(failure) = &state.failure {
                return Err(io::Error::new(io::ErrorKind::Other, failure.clone()));
            }
            if state.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bridge reader closed"));
            }
            if state.writer_closed || state.writer_aborted {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bridge writer closed"));
            }
            let space = state.capacity - state.buf.len();
            if space > 0 {
                let n = space.min(data.len());
                state.buf.extend(&data[..n]);
                drop(state);
                self.readable.notify_one();
                return Ok(n);
            }
            state = self.writable.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Move buffered bytes into `out`, waiting until some exist or the
    /// writer side has ended.
    pub(super) fn pull(&self, out: &mut [u8]) -> io::Result<Pulled> {
        let mut state = self.lock();
        loop {
            if let Some(failure) = &state.failure {
                return Err(io::Error::new(io::ErrorKind::Other, failure.clone()));
            }
            if !state.buf.is_empty() {
                let n = state.buf.len().min(out.len());
                for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                drop(state);
                self.writable.notify_one();
                return Ok(Pulled::Bytes(n));
            }
            if state.writer_closed {
                return Ok(Pulled::End);
            }
            if state.writer_aborted {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "bridge writer dropped before finishing",
                ));
            }
            state = self.readable.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(super) fn close_writer(&self) {
        self.lock().writer_closed = true;
        self.readable.notify_all();
    }

    pub(super) fn abort_writer(&self) {
        self.lock().writer_aborted = true;
        self.readable.notify_all();
    }

    pub(super) fn close_reader(&self) {
        self.lock().reader_closed = true;
        self.writable.notify_all();
    }

    pub(super) fn reader_closed(&self) -> bool {
        self.lock().reader_closed
    }

    /// Record a failure. The first one wins.
    pub(super) fn fail(&self, err: BridgeError) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(err);
        }
        drop(state);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub(super) fn failure(&self) -> Option<BridgeError> {
        self.lock().failure.clone()
    }
}

/// Writing half handed to a producer or used by a `BridgeWriter`.
pub(super) struct PipeWriter {
    pipe: Arc<Pipe>,
    written: u64,
    progress: Option<ProgressFn>,
}

impl PipeWriter {
    pub(super) fn new(pipe: Arc<Pipe>, progress: Option<ProgressFn>) -> Self {
        Self { pipe, written: 0, progress }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.pipe.push(buf)?;
        if n > 0 {
            self.written += n as u64;
            if let Some(progress) = &self.progress {
                progress(self.written);
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reading half handed to a sink.
pub(super) struct PipeReader {
    pipe: Arc<Pipe>,
}

impl PipeReader {
    pub(super) fn new(pipe: Arc<Pipe>) -> Self {
        Self { pipe }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.pipe.pull(buf)? {
            Pulled::Bytes(n) => Ok(n),
            Pulled::End => Ok(0),
        }
    }
}
