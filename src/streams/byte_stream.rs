use super::{
    error::{StreamError, StreamResult},
    promise::{Outcome, Promise, PromiseSlot},
    queue::extract_high_water_mark,
    readable::{
        ChunkQueue, ReadableHandle, ReadableStream, ReadableStreamInner, ReaderKind,
        ReaderRecord, StreamState, WeakReadableHandle, readable_stream_task,
    },
};
use crate::platform::{MaybeSend, PlatformBoxFutureStatic, SharedPtr, WeakPtr};
use futures::channel::{mpsc::unbounded, oneshot};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, future::Future};
use tracing::trace;

// ----------- Byte Source Trait -----------
/// Producer behind a byte stream (`type: "bytes"`).
pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        _controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(&mut self, _reason: Option<String>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }
}

impl<S: ReadableByteSource> super::readable::PullSource<ReadableByteStreamController> for S {
    fn start_source(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.start(controller)
    }

    fn pull_source(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.pull(controller)
    }

    fn cancel_source(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.cancel(reason)
    }
}

/// Result of a BYOB read: the caller's buffer, truncated to the bytes written into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIntoResult {
    pub value: Vec<u8>,
    pub done: bool,
}

type ReadIntoRequest = oneshot::Sender<StreamResult<ReadIntoResult>>;

struct QueuedBytes {
    bytes: Vec<u8>,
    offset: usize,
}

impl QueuedBytes {
    fn remaining(&self) -> &[u8] {
        &self.bytes[self.offset..]
    }
}

struct PullIntoDescriptor {
    buffer: Vec<u8>,
    filled: usize,
    min: usize,
    completion: ReadIntoRequest,
}

impl PullIntoDescriptor {
    fn commit(mut self, done: bool) {
        self.buffer.truncate(self.filled);
        let _ = self.completion.send(Ok(ReadIntoResult {
            value: self.buffer,
            done,
        }));
    }
}

// ----------- Byte Queue -----------
/// Queue of a byte controller: raw byte chunks plus the BYOB reads waiting to be filled.
pub(crate) struct ByteQueue<T> {
    chunks: VecDeque<QueuedBytes>,
    total_bytes: usize,
    pull_intos: VecDeque<PullIntoDescriptor>,
    wrap: fn(Vec<u8>) -> T,
}

impl<T> ByteQueue<T> {
    pub(crate) fn new(wrap: fn(Vec<u8>) -> T) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            pull_intos: VecDeque::new(),
            wrap,
        }
    }

    pub(crate) fn total_size(&self) -> f64 {
        self.total_bytes as f64
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub(crate) fn reset(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub(crate) fn num_pull_intos(&self) -> usize {
        self.pull_intos.len()
    }

    fn push(&mut self, bytes: Vec<u8>) {
        self.total_bytes += bytes.len();
        self.chunks.push_back(QueuedBytes { bytes, offset: 0 });
    }

    /// Whole front chunk, minus whatever a BYOB read already took from it.
    pub(crate) fn dequeue_chunk(&mut self) -> Option<T> {
        let QueuedBytes { mut bytes, offset } = self.chunks.pop_front()?;
        self.total_bytes -= bytes.len() - offset;
        if offset > 0 {
            bytes.drain(..offset);
        }
        Some((self.wrap)(bytes))
    }

    /// Copies queued bytes into `descriptor`; true once it holds at least `min` bytes.
    fn fill(&mut self, descriptor: &mut PullIntoDescriptor) -> bool {
        while descriptor.filled < descriptor.buffer.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let space = descriptor.buffer.len() - descriptor.filled;
            let count = space.min(front.remaining().len());
            descriptor.buffer[descriptor.filled..descriptor.filled + count]
                .copy_from_slice(&front.remaining()[..count]);
            descriptor.filled += count;
            front.offset += count;
            self.total_bytes -= count;
            if front.remaining().is_empty() {
                self.chunks.pop_front();
            }
        }
        descriptor.filled >= descriptor.min
    }

    fn process_pull_intos(&mut self) {
        while !self.is_empty() {
            let Some(mut descriptor) = self.pull_intos.pop_front() else {
                break;
            };
            if descriptor.filled == 0 && descriptor.completion.is_canceled() {
                continue;
            }
            if self.fill(&mut descriptor) {
                descriptor.commit(false);
            } else {
                self.pull_intos.push_front(descriptor);
                break;
            }
        }
    }

    pub(crate) fn close_pull_intos(&mut self) {
        for descriptor in self.pull_intos.drain(..) {
            descriptor.commit(true);
        }
    }

    pub(crate) fn reject_pull_intos(&mut self, error: &StreamError) {
        for descriptor in self.pull_intos.drain(..) {
            let _ = descriptor.completion.send(Err(error.clone()));
        }
    }
}

// ----------- Byte Controller Operations -----------
impl ReadableStreamInner<Vec<u8>> {
    fn bytes_mut(&mut self) -> Option<&mut ByteQueue<Vec<u8>>> {
        match &mut self.queue {
            ChunkQueue::Bytes(bytes) => Some(bytes),
            ChunkQueue::Default { .. } => None,
        }
    }

    fn has_byob_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderRecord {
                kind: ReaderKind::Byob,
                ..
            })
        )
    }

    fn byte_enqueue(&mut self, chunk: Vec<u8>) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits enqueue",
            ));
        }
        if chunk.is_empty() {
            return Err(StreamError::type_error("Chunk must have a non-zero byte length"));
        }
        self.prune_read_requests();
        let byob = self.has_byob_reader();
        let leftover = if self.num_read_requests() > 0 {
            self.fulfill_read_request(chunk)
        } else {
            Some(chunk)
        };
        if let (Some(chunk), Some(bytes)) = (leftover, self.bytes_mut()) {
            bytes.push(chunk);
            if byob {
                bytes.process_pull_intos();
            }
        }
        self.call_pull_if_needed();
        Ok(())
    }

    fn byte_close(&mut self) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits close",
            ));
        }
        if self.queue_total_size() > 0.0 {
            self.close_requested = true;
            return Ok(());
        }
        self.close_requested = true;
        self.clear_algorithms();
        self.close_stream();
        Ok(())
    }

    fn read_into(&mut self, reader_id: u64, buffer: Vec<u8>, min: usize) -> Outcome<ReadIntoResult> {
        if !self.owns_reader(reader_id) {
            return Outcome::Ready(Err(StreamError::released()));
        }
        self.disturbed = true;
        if self.state == StreamState::Errored {
            return Outcome::Ready(Err(self.stored_error()));
        }
        let (completion, outcome) = Outcome::channel();
        let mut descriptor = PullIntoDescriptor {
            buffer,
            filled: 0,
            min,
            completion,
        };
        let close_requested = self.close_requested;
        let closed = self.state == StreamState::Closed;
        let Some(bytes) = self.bytes_mut() else {
            return Outcome::Ready(Err(StreamError::type_error("Not a byte stream")));
        };

        if bytes.num_pull_intos() > 0 {
            bytes.pull_intos.push_back(descriptor);
            return outcome;
        }
        if closed {
            descriptor.commit(true);
            return outcome;
        }
        if !bytes.is_empty() && bytes.fill(&mut descriptor) {
            descriptor.commit(false);
            self.handle_queue_drain();
            return outcome;
        }
        if close_requested {
            let error = StreamError::type_error("Insufficient bytes to fill elements");
            self.controller_error(error.clone());
            return Outcome::Ready(Err(error));
        }
        bytes.pull_intos.push_back(descriptor);
        self.call_pull_if_needed();
        outcome
    }
}

// ----------- Controller -----------
/// Handle a byte source uses to feed its stream.
#[derive(Clone)]
pub struct ReadableByteStreamController {
    stream: WeakReadableHandle<Vec<u8>>,
}

impl ReadableByteStreamController {
    fn with_stream<R>(&self, f: impl FnOnce(&mut ReadableStreamInner<Vec<u8>>) -> R) -> Option<R> {
        let stream = self.stream.upgrade()?;
        let mut inner = stream.lock();
        Some(f(&mut inner))
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.with_stream(|stream| stream.desired_size()).flatten()
    }

    /// Queues bytes, serving waiting reads first. Empty chunks are rejected.
    pub fn enqueue(&self, chunk: Vec<u8>) -> StreamResult<()> {
        self.with_stream(|stream| stream.byte_enqueue(chunk))
            .unwrap_or_else(|| Err(StreamError::detached()))
    }

    pub fn close(&self) -> StreamResult<()> {
        self.with_stream(|stream| stream.byte_close())
            .unwrap_or_else(|| Err(StreamError::detached()))
    }

    pub fn error(&self, error: StreamError) {
        self.with_stream(|stream| stream.controller_error(error));
    }
}

// ----------- Builder -----------
pub struct ReadableByteStreamBuilder<Source> {
    source: Source,
    high_water_mark: f64,
}

impl<Source: ReadableByteSource> ReadableByteStreamBuilder<Source> {
    pub fn high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<Vec<u8>>,
        impl Future<Output = ()> + MaybeSend + 'static,
    )> {
        let high_water_mark = extract_high_water_mark(self.high_water_mark)?;
        let (tx, rx) = unbounded();
        let queue = ChunkQueue::Bytes(ByteQueue::new(std::convert::identity));
        let inner = SharedPtr::new(Mutex::new(ReadableStreamInner::new(
            queue,
            high_water_mark,
            tx,
        )));
        let weak = SharedPtr::downgrade(&inner);
        let controller = ReadableByteStreamController {
            stream: WeakPtr::clone(&weak),
        };
        let stream = ReadableStream { inner };
        let driver = readable_stream_task(self.source, controller, weak, rx);
        Ok((stream, driver))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<Vec<u8>>>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, driver) = self.prepare()?;
        spawn_fn(Box::pin(driver));
        Ok(stream)
    }
}

impl ReadableStream<Vec<u8>> {
    /// Byte stream whose source feeds a [`ReadableByteStreamController`]. High water mark
    /// defaults to 0.
    pub fn builder_bytes<Source: ReadableByteSource>(
        source: Source,
    ) -> ReadableByteStreamBuilder<Source> {
        ReadableByteStreamBuilder {
            source,
            high_water_mark: 0.0,
        }
    }

    pub fn is_byte_stream(&self) -> bool {
        matches!(self.inner.lock().queue, ChunkQueue::Bytes(_))
    }

    /// Locks a byte stream to a reader that fills caller-supplied buffers.
    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamBYOBReader> {
        let mut inner = self.inner.lock();
        if !matches!(inner.queue, ChunkQueue::Bytes(_)) {
            return Err(StreamError::type_error(
                "BYOB readers require a readable byte stream",
            ));
        }
        let (id, closed) = inner.acquire_reader(ReaderKind::Byob)?;
        Ok(ReadableStreamBYOBReader {
            stream: SharedPtr::clone(&self.inner),
            id,
            closed,
        })
    }
}

// ----------- BYOB Reader -----------
pub struct ReadableStreamBYOBReader {
    stream: ReadableHandle<Vec<u8>>,
    id: u64,
    closed: SharedPtr<Mutex<PromiseSlot<()>>>,
}

impl ReadableStreamBYOBReader {
    /// Reads at least one byte into `buffer`.
    pub fn read(
        &self,
        buffer: Vec<u8>,
    ) -> impl Future<Output = StreamResult<ReadIntoResult>> + 'static {
        self.read_with_min(buffer, 1)
    }

    /// Resolves once `buffer` holds at least `min` bytes, or the stream closes.
    pub fn read_with_min(
        &self,
        buffer: Vec<u8>,
        min: usize,
    ) -> impl Future<Output = StreamResult<ReadIntoResult>> + 'static {
        let outcome = if buffer.is_empty() {
            Outcome::Ready(Err(StreamError::type_error(
                "Buffer must have a non-zero byte length",
            )))
        } else if min == 0 || min > buffer.len() {
            Outcome::Ready(Err(StreamError::range_error(
                "min must be at least 1 and at most the buffer length",
            )))
        } else {
            trace!(len = buffer.len(), min, "byob read");
            self.stream.lock().read_into(self.id, buffer, min)
        };
        outcome.wait()
    }

    pub fn closed(&self) -> Promise<()> {
        self.closed.lock().promise()
    }

    pub fn cancel(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = self.stream.lock().reader_cancel(self.id, reason);
        outcome.wait()
    }

    /// Unlocks the stream; reads still waiting reject with a TypeError.
    pub fn release_lock(&self) {
        self.stream.lock().release_reader(self.id);
    }
}

impl fmt::Debug for ReadableStreamBYOBReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let released = !self.stream.lock().owns_reader(self.id);
        f.debug_struct("ReadableStreamBYOBReader")
            .field("released", &released)
            .finish()
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        self.stream.lock().release_reader(self.id);
    }
}
