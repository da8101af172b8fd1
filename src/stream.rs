use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use crate::connection::ConnectionInner;
use crate::protocol::{AdbError, Message};

/// Poison-tolerant lock: a panicked holder must not wedge the connection.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Opening,
    Open,
    Closed,
}

struct StreamShared {
    state: StreamState,
    remote_id: u32,
    inbound: VecDeque<u8>,
    /// True iff the most recent outbound WRTE has been acknowledged; ADB
    /// allows one outstanding WRTE per stream.
    write_acked: bool,
}

/// Shared per-stream state. The connection's stream map holds the strong
/// reference while the stream is live; the `AdbStream` handle keeps it
/// readable after removal.
pub(crate) struct StreamInner {
    local_id: u32,
    max_payload: usize,
    shared: Mutex<StreamShared>,
    readable: Condvar,
    writable: Condvar,
}

impl StreamInner {
    pub(crate) fn new(local_id: u32, max_payload: usize) -> Self {
        Self {
            local_id,
            max_payload,
            shared: Mutex::new(StreamShared {
                state: StreamState::Opening,
                remote_id: 0,
                inbound: VecDeque::new(),
                write_acked: true,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Reader task: OKAY for this stream. Binds the remote id on the first
    /// one, opens the ack-gate on the rest.
    pub(crate) fn handle_ready(&self, remote_id: u32) {
        let mut shared = lock(&self.shared);
        match shared.state {
            StreamState::Opening => {
                shared.remote_id = remote_id;
                shared.state = StreamState::Open;
                shared.write_acked = true;
                self.readable.notify_all();
                self.writable.notify_all();
            }
            StreamState::Open => {
                shared.write_acked = true;
                self.writable.notify_all();
            }
            StreamState::Closed => {}
        }
    }

    /// Reader task: WRTE payload for this stream. Returns false if the
    /// stream is already closed and the payload must be refused.
    pub(crate) fn push_inbound(&self, payload: Vec<u8>) -> bool {
        let mut shared = lock(&self.shared);
        if shared.state == StreamState::Closed {
            return false;
        }
        shared.inbound.extend(payload);
        self.readable.notify_all();
        true
    }

    /// Transition to CLOSED and wake every blocked reader and writer.
    pub(crate) fn mark_closed(&self) {
        let mut shared = lock(&self.shared);
        if shared.state == StreamState::Closed {
            return;
        }
        shared.state = StreamState::Closed;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Block until the reader task resolves an OPEN: the first OKAY flips
    /// the stream to Open, a CLSE (or teardown) to Closed.
    pub(crate) fn await_open(&self) -> StreamState {
        let mut shared = lock(&self.shared);
        while shared.state == StreamState::Opening {
            shared = wait(&self.readable, shared);
        }
        shared.state
    }
}

/// A bidirectional logical stream multiplexed over an ADB connection.
///
/// Reads block until data arrives or the stream closes; writes are chunked
/// at the negotiated maximum payload and flow-controlled by the peer's
/// OKAY acknowledgements.
pub struct AdbStream {
    inner: Arc<StreamInner>,
    connection: Weak<ConnectionInner>,
}

impl AdbStream {
    pub(crate) fn new(inner: Arc<StreamInner>, connection: Weak<ConnectionInner>) -> Self {
        Self { inner, connection }
    }

    /// The local identifier of this stream, unique per connection
    pub fn local_id(&self) -> u32 {
        self.inner.local_id
    }

    /// Read buffered bytes, blocking until data arrives or the stream is
    /// closed. Returns `Ok(0)` for end-of-stream once the buffer is
    /// drained.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, AdbError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut shared = lock(&self.inner.shared);
        loop {
            if !shared.inbound.is_empty() {
                let n = buf.len().min(shared.inbound.len());
                for (dst, src) in buf.iter_mut().zip(shared.inbound.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if shared.state == StreamState::Closed {
                return Ok(0);
            }
            shared = wait(&self.inner.readable, shared);
        }
    }

    /// Read until end-of-stream
    pub fn read_to_end(&self) -> Result<Vec<u8>, AdbError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write all of `data`, fragmented into frames no larger than the
    /// negotiated maximum payload. Each frame waits for the peer's OKAY
    /// before the next one is sent.
    pub fn write(&self, data: &[u8]) -> Result<(), AdbError> {
        if data.is_empty() {
            return Ok(());
        }
        let connection = self.connection.upgrade().ok_or(AdbError::StreamClosed)?;
        for chunk in data.chunks(self.inner.max_payload) {
            // claim the ack-gate
            let remote_id = {
                let mut shared = lock(&self.inner.shared);
                loop {
                    if shared.state == StreamState::Closed {
                        return Err(AdbError::StreamClosed);
                    }
                    if shared.state == StreamState::Open && shared.write_acked {
                        break;
                    }
                    shared = wait(&self.inner.writable, shared);
                }
                shared.write_acked = false;
                shared.remote_id
            };

            connection.send_frame(&Message::write(self.inner.local_id, remote_id, chunk))?;

            // gate reopens on the matching OKAY
            let mut shared = lock(&self.inner.shared);
            while !shared.write_acked {
                if shared.state == StreamState::Closed {
                    return Err(AdbError::StreamClosed);
                }
                shared = wait(&self.inner.writable, shared);
            }
        }
        Ok(())
    }

    /// Close the stream. The first call notifies the peer with CLSE;
    /// buffered inbound bytes stay readable until drained. Subsequent
    /// calls are no-ops.
    pub fn close(&self) {
        let (was_open, remote_id) = {
            let mut shared = lock(&self.inner.shared);
            if shared.state == StreamState::Closed {
                return;
            }
            let was_open = shared.state == StreamState::Open;
            shared.state = StreamState::Closed;
            self.inner.readable.notify_all();
            self.inner.writable.notify_all();
            (was_open, shared.remote_id)
        };
        if let Some(connection) = self.connection.upgrade() {
            connection.remove_stream(self.inner.local_id);
            if was_open {
                let _ = connection.send_frame(&Message::close(self.inner.local_id, remote_id));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.shared).state == StreamState::Closed
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        self.close();
    }
}
