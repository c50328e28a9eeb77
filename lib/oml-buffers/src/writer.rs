use std::{collections::VecDeque, sync::Arc, thread};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    chunk::Chunk,
    internal_events::{ChunkDropped, SinkWriteFailed},
    sink::OutStream,
};

/// Lifecycle of a [`BufferedWriter`].
///
/// `close()` moves `Running` to `Draining`; once the queue has emptied (or
/// the sink failed terminally) the drain worker moves to `Closed` and exits.
/// There are no transitions out of `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Running,
    Draining,
    Closed,
}

struct Queue {
    data: VecDeque<Chunk>,
    meta: Chunk,
    /// Bytes of the meta payload a sink write has confirmed at least once.
    meta_sent: usize,
    /// Unconsumed data-lane bytes across all queued chunks.
    bytes: usize,
    dropped_chunks: u64,
    dropped_bytes: u64,
    state: WriterState,
}

impl Queue {
    fn new() -> Self {
        Self {
            data: VecDeque::new(),
            meta: Chunk::growable(),
            meta_sent: 0,
            bytes: 0,
            dropped_chunks: 0,
            dropped_bytes: 0,
            state: WriterState::Running,
        }
    }

    fn flushable(&self) -> bool {
        self.data.iter().any(|c| !c.is_empty())
    }

    /// Appends `data` to the data lane, evicting the oldest foreign chunks
    /// when the lane is at capacity. Bytes belonging to the current push are
    /// never evicted, so a single push accepts at most `capacity` bytes.
    fn push_bytes(&mut self, data: &[u8], capacity: usize, chunk_size: usize) -> usize {
        let mut accepted = 0;
        // Number of chunks ahead of this push's first byte; only those may
        // be evicted by the drop policy.
        let mut foreign_ahead: Option<usize> = None;

        while accepted < data.len() {
            if self.bytes >= capacity {
                if foreign_ahead == Some(0) {
                    break;
                }
                let Some(old) = self.data.pop_front() else {
                    break;
                };
                self.bytes -= old.len();
                self.dropped_chunks += 1;
                self.dropped_bytes += old.len() as u64;
                ChunkDropped {
                    byte_size: old.len(),
                    reason: "queue_full",
                }
                .emit();
                if let Some(ahead) = foreign_ahead.as_mut() {
                    *ahead -= 1;
                }
                continue;
            }

            if self.data.back().is_none_or(|c| c.wr_remaining() == 0) {
                self.data.push_back(Chunk::with_capacity(chunk_size));
            }
            let index = self.data.len() - 1;
            let room = capacity - self.bytes;
            let take = (data.len() - accepted).min(room);
            let Some(tail) = self.data.back_mut() else {
                break;
            };
            let n = tail.write(&data[accepted..accepted + take]);
            if n > 0 && foreign_ahead.is_none() {
                foreign_ahead = Some(index);
            }
            accepted += n;
            self.bytes += n;
        }

        if accepted < data.len() {
            let refused = data.len() - accepted;
            self.dropped_bytes += refused as u64;
            ChunkDropped {
                byte_size: refused,
                reason: "push_truncated",
            }
            .emit();
        }
        accepted
    }
}

struct Inner {
    queue: Mutex<Queue>,
    work_available: Condvar,
    queue_capacity: usize,
    chunk_size: usize,
}

/// A bounded, chunked byte queue drained into an [`OutStream`] by a
/// background worker.
///
/// Producers never block on sink I/O, only on the queue mutex. The data lane
/// is bounded to `queue_capacity` bytes; on overflow the *oldest* data chunk
/// is dropped, on the grounds that producers may be real-time sensors which
/// must not be back-pressured and that the earliest samples are the least
/// valuable ones. The meta lane (connection preface) is unbounded and never
/// dropped; it is handed to the sink on every write so a reconnecting sink
/// can re-emit it.
pub struct BufferedWriter {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BufferedWriter {
    /// Creates a writer draining into `sink`.
    ///
    /// `queue_capacity` bounds the data lane in bytes; it is chained in
    /// chunks of `chunk_size` bytes.
    pub fn new<S>(sink: S, queue_capacity: usize, chunk_size: usize) -> Self
    where
        S: OutStream + 'static,
    {
        let chunk_size = chunk_size.clamp(1, queue_capacity.max(1));
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::new()),
            work_available: Condvar::new(),
            queue_capacity,
            chunk_size,
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("buffered-writer-drain".into())
            .spawn(move || drain_loop(&worker_inner, sink));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(error) => {
                error!(message = "Could not spawn drain worker.", %error);
                inner.queue.lock().state = WriterState::Closed;
                None
            }
        };

        Self { inner, worker }
    }

    /// Appends `data` to the data lane, returning the bytes accepted.
    ///
    /// Returns 0 when the writer is no longer running or nothing could be
    /// queued.
    pub fn push(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut queue = self.inner.queue.lock();
        if queue.state != WriterState::Running {
            return 0;
        }
        let accepted = queue.push_bytes(data, self.inner.queue_capacity, self.inner.chunk_size);
        if accepted > 0 {
            self.inner.work_available.notify_one();
        }
        accepted
    }

    /// Appends `data` to the meta lane. Never fails while the writer is
    /// running; the meta chunk grows as needed.
    pub fn push_meta(&self, data: &[u8]) -> usize {
        let mut queue = self.inner.queue.lock();
        if queue.state != WriterState::Running {
            return 0;
        }
        let n = queue.meta.write(data);
        self.inner.work_available.notify_one();
        n
    }

    /// Acquires the tail chunk for zero-copy writes.
    ///
    /// The queue mutex is held for the lifetime of the guard, excluding
    /// other producers and the drain worker; dropping the guard releases it
    /// and wakes the worker.
    pub fn write_buf(&self) -> WriteBuf<'_> {
        let queue = self.inner.queue.lock();
        let start_len = queue.data.back().map_or(0, Chunk::len);
        WriteBuf {
            queue,
            work_available: &self.inner.work_available,
            chunk_size: self.inner.chunk_size,
            start_len,
        }
    }

    /// Unconsumed data-lane bytes currently queued.
    pub fn outstanding(&self) -> usize {
        self.inner.queue.lock().bytes
    }

    /// Chunks dropped by the overflow policy since creation.
    pub fn dropped_chunks(&self) -> u64 {
        self.inner.queue.lock().dropped_chunks
    }

    pub fn state(&self) -> WriterState {
        self.inner.queue.lock().state
    }

    /// Requests drain-to-completion and waits for the worker to exit.
    ///
    /// All queued data (and an unflushed preface, if any) reaches the sink
    /// before it is closed; there is no abortive close.
    pub fn close(&mut self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.state == WriterState::Running {
                queue.state = WriterState::Draining;
            }
            self.inner.work_available.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(message = "Drain worker panicked.");
                self.inner.queue.lock().state = WriterState::Closed;
            }
        }
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.close();
        }
    }
}

/// Exclusive hold on the writer's tail chunk; see [`BufferedWriter::write_buf`].
pub struct WriteBuf<'a> {
    queue: MutexGuard<'a, Queue>,
    work_available: &'a Condvar,
    chunk_size: usize,
    start_len: usize,
}

impl WriteBuf<'_> {
    /// The current tail chunk, allocating a fresh one when the tail is full.
    ///
    /// Writes through the guard are bounded by the chunk capacity rather
    /// than the queue capacity; the drop policy does not run under the
    /// guard.
    pub fn chunk(&mut self) -> &mut Chunk {
        if self.queue.data.back().is_none_or(|c| c.wr_remaining() == 0) {
            self.settle();
            self.queue.data.push_back(Chunk::with_capacity(self.chunk_size));
            self.start_len = 0;
        }
        self.queue
            .data
            .back_mut()
            .expect("tail chunk was just ensured")
    }

    /// Folds bytes written through the guard into the queue accounting.
    fn settle(&mut self) {
        let tail_len = self.queue.data.back().map_or(0, Chunk::len);
        let delta = tail_len.saturating_sub(self.start_len);
        self.queue.bytes += delta;
        self.start_len = tail_len;
    }
}

impl Drop for WriteBuf<'_> {
    fn drop(&mut self) {
        self.settle();
        self.work_available.notify_one();
    }
}

fn drain_loop<S: OutStream>(inner: &Inner, mut sink: S) {
    loop {
        let mut queue = inner.queue.lock();
        while !queue.flushable() && queue.state == WriterState::Running {
            inner.work_available.wait(&mut queue);
        }

        // Skip chunks a zero-copy producer allocated but never filled.
        while queue.data.front().is_some_and(Chunk::is_empty) {
            queue.data.pop_front();
        }

        let Some(mut chunk) = queue.data.pop_front() else {
            // Queue drained while draining or closing: make sure the sink
            // saw the preface at least once, then shut down.
            let header = if queue.meta_sent < queue.meta.written() {
                queue.meta.payload().to_vec()
            } else {
                Vec::new()
            };
            drop(queue);
            if !header.is_empty() {
                if let Err(error) = sink.write(&[], &header) {
                    warn!(message = "Could not flush preface on close.", %error);
                }
            }
            if let Err(error) = sink.close() {
                warn!(message = "Sink close failed.", %error);
            }
            inner.queue.lock().state = WriterState::Closed;
            return;
        };

        queue.bytes -= chunk.len();
        let header = queue.meta.payload().to_vec();
        drop(queue);

        match sink.write(chunk.unread(), &header) {
            Ok(n) => {
                chunk.consume(n);
                chunk.mark_flushed();
                let mut queue = inner.queue.lock();
                queue.meta_sent = queue.meta_sent.max(header.len());
                if !chunk.is_empty() {
                    // Partial write: the unwritten suffix stays at the front
                    // so nothing is silently truncated across reconnects.
                    queue.bytes += chunk.len();
                    queue.data.push_front(chunk);
                }
            }
            Err(error) => {
                // A failed chunk is discarded rather than retried forever;
                // the sink re-emits the preface once it recovers.
                SinkWriteFailed {
                    dest: sink.dest().to_string(),
                    error: error.to_string(),
                    dropped_bytes: chunk.len(),
                }
                .emit();
            }
        }
    }
}
