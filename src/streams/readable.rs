use super::{
    CountQueuingStrategy, QueuingStrategy,
    byte_stream::ByteQueue,
    error::{StreamError, StreamResult},
    promise::{Outcome, Promise, PromiseSlot},
    queue::{QueueWithSizes, chunk_size, extract_strategy},
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, SharedPtr, WeakPtr};
use futures::{
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        oneshot,
    },
    future::{self, Either},
    stream::{Stream, StreamExt},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::{Pin, pin},
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source Trait -----------
/// Producer behind a [`ReadableStream`].
///
/// Every method runs on the stream's driver task, one at a time. `pull` is called again
/// only after the previous call finished and the stream wants more data.
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }

    fn cancel(&mut self, _reason: Option<String>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }
}

/// Uniform view over default and byte sources so one driver serves both.
pub(crate) trait PullSource<C>: MaybeSend + 'static {
    fn start_source(&mut self, controller: &mut C) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn pull_source(&mut self, controller: &mut C) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel_source(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;
}

impl<T, S> PullSource<ReadableStreamDefaultController<T>> for S
where
    T: MaybeSend + 'static,
    S: ReadableSource<T>,
{
    fn start_source(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.start(controller)
    }

    fn pull_source(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
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

// ----------- Driver Commands -----------
pub(crate) enum SourceCommand {
    Pull,
    Cancel {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    /// Algorithms were cleared; the driver drops the source.
    Shutdown,
}

pub(crate) type ReadRequest<T> = oneshot::Sender<StreamResult<Option<T>>>;

pub(crate) enum ReaderKind<T> {
    Default(VecDeque<ReadRequest<T>>),
    Byob,
}

pub(crate) struct ReaderRecord<T> {
    id: u64,
    closed: SharedPtr<Mutex<PromiseSlot<()>>>,
    pub(crate) kind: ReaderKind<T>,
}

pub(crate) enum ChunkQueue<T> {
    Default {
        queue: QueueWithSizes<T>,
        strategy: BoxedStrategy<T>,
    },
    Bytes(ByteQueue<T>),
}

pub(crate) type ReadableHandle<T> = SharedPtr<Mutex<ReadableStreamInner<T>>>;

/// Held by the driver and controllers. Once the stream and its readers are gone the
/// command channel closes and the driver returns.
pub(crate) type WeakReadableHandle<T> = WeakPtr<Mutex<ReadableStreamInner<T>>>;

// ----------- Stream State -----------
pub(crate) struct ReadableStreamInner<T> {
    pub(crate) state: StreamState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<ReaderRecord<T>>,
    next_reader_id: u64,
    pub(crate) queue: ChunkQueue<T>,
    pub(crate) high_water_mark: f64,
    started: bool,
    pub(crate) close_requested: bool,
    pulling: bool,
    pull_again: bool,
    algorithms_cleared: bool,
    commands: UnboundedSender<SourceCommand>,
}

impl<T> ReadableStreamInner<T> {
    pub(crate) fn new(
        queue: ChunkQueue<T>,
        high_water_mark: f64,
        commands: UnboundedSender<SourceCommand>,
    ) -> Self {
        Self {
            state: StreamState::Readable,
            stored_error: None,
            disturbed: false,
            reader: None,
            next_reader_id: 0,
            queue,
            high_water_mark,
            started: false,
            close_requested: false,
            pulling: false,
            pull_again: false,
            algorithms_cleared: false,
            commands,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn owns_reader(&self, id: u64) -> bool {
        self.reader.as_ref().is_some_and(|reader| reader.id == id)
    }

    pub(crate) fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("The stream is errored"))
    }

    /// Requests whose futures were dropped can never be answered.
    pub(crate) fn prune_read_requests(&mut self) {
        if let Some(ReaderRecord {
            kind: ReaderKind::Default(requests),
            ..
        }) = &mut self.reader
        {
            requests.retain(|request| !request.is_canceled());
        }
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderRecord {
                kind: ReaderKind::Default(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    fn add_read_request(&mut self, request: ReadRequest<T>) {
        if let Some(ReaderRecord {
            kind: ReaderKind::Default(requests),
            ..
        }) = &mut self.reader
        {
            requests.push_back(request);
        }
    }

    /// Hands `chunk` to the oldest live read request, returning it when none accepted it.
    pub(crate) fn fulfill_read_request(&mut self, chunk: T) -> Option<T> {
        let Some(ReaderRecord {
            kind: ReaderKind::Default(requests),
            ..
        }) = &mut self.reader
        else {
            return Some(chunk);
        };
        let mut chunk = chunk;
        while let Some(request) = requests.pop_front() {
            match request.send(Ok(Some(chunk))) {
                Ok(()) => return None,
                Err(Ok(Some(returned))) => chunk = returned,
                Err(_) => return None,
            }
        }
        Some(chunk)
    }

    // ReadableStreamClose
    pub(crate) fn close_stream(&mut self) {
        if self.state != StreamState::Readable {
            return;
        }
        self.state = StreamState::Closed;
        debug!("readable stream closed");
        if let Some(reader) = &mut self.reader {
            if let ReaderKind::Default(requests) = &mut reader.kind {
                for request in requests.drain(..) {
                    let _ = request.send(Ok(None));
                }
            }
            reader.closed.lock().resolve(());
        }
        if let ChunkQueue::Bytes(bytes) = &mut self.queue {
            bytes.close_pull_intos();
        }
    }

    // ReadableStreamError
    pub(crate) fn error_stream(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        self.state = StreamState::Errored;
        self.stored_error = Some(error.clone());
        debug!(%error, "readable stream errored");
        if let Some(reader) = &mut self.reader {
            reader.closed.lock().reject(error.clone());
            if let ReaderKind::Default(requests) = &mut reader.kind {
                for request in requests.drain(..) {
                    let _ = request.send(Err(error.clone()));
                }
            }
        }
        if let ChunkQueue::Bytes(bytes) = &mut self.queue {
            bytes.reject_pull_intos(&error);
        }
    }

    // ReadableStreamCancel
    pub(crate) fn cancel(&mut self, reason: Option<String>) -> Outcome<()> {
        self.disturbed = true;
        match self.state {
            StreamState::Closed => return Outcome::Ready(Ok(())),
            StreamState::Errored => return Outcome::Ready(Err(self.stored_error())),
            StreamState::Readable => {}
        }
        debug!(?reason, "canceling readable stream");
        self.close_stream();
        self.reset_queue();
        if self.algorithms_cleared {
            return Outcome::Ready(Ok(()));
        }
        let (completion, outcome) = Outcome::channel();
        let _ = self
            .commands
            .unbounded_send(SourceCommand::Cancel { reason, completion });
        self.clear_algorithms();
        outcome
    }

    // ----------- Controller Operations -----------
    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == StreamState::Readable
    }

    pub(crate) fn queue_total_size(&self) -> f64 {
        match &self.queue {
            ChunkQueue::Default { queue, .. } => queue.total_size(),
            ChunkQueue::Bytes(bytes) => bytes.total_size(),
        }
    }

    fn queue_is_empty(&self) -> bool {
        match &self.queue {
            ChunkQueue::Default { queue, .. } => queue.is_empty(),
            ChunkQueue::Bytes(bytes) => bytes.is_empty(),
        }
    }

    fn reset_queue(&mut self) {
        match &mut self.queue {
            ChunkQueue::Default { queue, .. } => queue.reset(),
            ChunkQueue::Bytes(bytes) => bytes.reset(),
        }
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state {
            StreamState::Readable => Some(self.high_water_mark - self.queue_total_size()),
            StreamState::Closed | StreamState::Errored => None,
        }
    }

    fn should_call_pull(&mut self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        self.prune_read_requests();
        let waiting_readers = match &self.queue {
            ChunkQueue::Default { .. } => self.num_read_requests(),
            ChunkQueue::Bytes(bytes) => self.num_read_requests() + bytes.num_pull_intos(),
        };
        if self.is_locked() && waiting_readers > 0 {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    pub(crate) fn has_backpressure(&mut self) -> bool {
        !self.should_call_pull()
    }

    pub(crate) fn call_pull_if_needed(&mut self) {
        if !self.should_call_pull() {
            return;
        }
        if self.pulling {
            self.pull_again = true;
            return;
        }
        self.pulling = true;
        trace!("requesting pull from source");
        let _ = self.commands.unbounded_send(SourceCommand::Pull);
    }

    pub(crate) fn clear_algorithms(&mut self) {
        if !self.algorithms_cleared {
            self.algorithms_cleared = true;
            let _ = self.commands.unbounded_send(SourceCommand::Shutdown);
        }
    }

    pub(crate) fn controller_close(&mut self) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits close",
            ));
        }
        self.close_requested = true;
        if self.queue_is_empty() {
            self.clear_algorithms();
            self.close_stream();
        }
        Ok(())
    }

    pub(crate) fn controller_enqueue(&mut self, chunk: T) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits enqueue",
            ));
        }
        self.prune_read_requests();
        let chunk = if self.num_read_requests() > 0 {
            match self.fulfill_read_request(chunk) {
                None => {
                    self.call_pull_if_needed();
                    return Ok(());
                }
                Some(chunk) => chunk,
            }
        } else {
            chunk
        };

        let size = match &self.queue {
            ChunkQueue::Default { strategy, .. } => chunk_size(strategy.as_ref(), &chunk),
            ChunkQueue::Bytes(_) => Err(StreamError::type_error(
                "Byte streams only accept byte chunks",
            )),
        };
        let size = match size {
            Ok(size) => size,
            Err(error) => {
                self.controller_error(error.clone());
                return Err(error);
            }
        };
        if let ChunkQueue::Default { queue, .. } = &mut self.queue {
            queue.enqueue(chunk, size);
        }
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn controller_error(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        self.reset_queue();
        self.clear_algorithms();
        self.error_stream(error);
    }

    /// Serves a read from the queue, or parks the request until a chunk arrives.
    fn pull_steps(&mut self, request: ReadRequest<T>) {
        let chunk = match &mut self.queue {
            ChunkQueue::Default { queue, .. } => queue.dequeue(),
            ChunkQueue::Bytes(bytes) => bytes.dequeue_chunk(),
        };
        match chunk {
            Some(chunk) => {
                self.handle_queue_drain();
                let _ = request.send(Ok(Some(chunk)));
            }
            None => {
                self.add_read_request(request);
                self.call_pull_if_needed();
            }
        }
    }

    pub(crate) fn handle_queue_drain(&mut self) {
        if self.close_requested && self.queue_is_empty() {
            self.clear_algorithms();
            self.close_stream();
        } else {
            self.call_pull_if_needed();
        }
    }

    // ----------- Reader Operations -----------
    pub(crate) fn acquire_reader(
        &mut self,
        kind: ReaderKind<T>,
    ) -> StreamResult<(u64, SharedPtr<Mutex<PromiseSlot<()>>>)> {
        if self.is_locked() {
            return Err(StreamError::type_error("ReadableStream is locked"));
        }
        let closed = match self.state {
            StreamState::Readable => PromiseSlot::pending(),
            StreamState::Closed => PromiseSlot::resolved(()),
            StreamState::Errored => PromiseSlot::rejected(self.stored_error()),
        };
        let closed = SharedPtr::new(Mutex::new(closed));
        let id = self.next_reader_id;
        self.next_reader_id += 1;
        self.reader = Some(ReaderRecord {
            id,
            closed: SharedPtr::clone(&closed),
            kind,
        });
        Ok((id, closed))
    }

    pub(crate) fn read(&mut self, reader_id: u64) -> Outcome<Option<T>> {
        if !self.owns_reader(reader_id) {
            return Outcome::Ready(Err(StreamError::released()));
        }
        self.disturbed = true;
        match self.state {
            StreamState::Closed => Outcome::Ready(Ok(None)),
            StreamState::Errored => Outcome::Ready(Err(self.stored_error())),
            StreamState::Readable => {
                let (request, outcome) = Outcome::channel();
                self.pull_steps(request);
                outcome
            }
        }
    }

    pub(crate) fn reader_cancel(&mut self, reader_id: u64, reason: Option<String>) -> Outcome<()> {
        if !self.owns_reader(reader_id) {
            return Outcome::Ready(Err(StreamError::released()));
        }
        self.cancel(reason)
    }

    /// Detaches the reader and rejects whatever it was still waiting for.
    pub(crate) fn release_reader(&mut self, reader_id: u64) {
        if !self.owns_reader(reader_id) {
            return;
        }
        let Some(reader) = self.reader.take() else {
            return;
        };
        let released = StreamError::type_error("Reader was released");
        reader.closed.lock().ensure_rejected(released.clone());
        match reader.kind {
            ReaderKind::Default(requests) => {
                for request in requests {
                    let _ = request.send(Err(released.clone()));
                }
            }
            ReaderKind::Byob => {
                if let ChunkQueue::Bytes(bytes) = &mut self.queue {
                    bytes.reject_pull_intos(&released);
                }
            }
        }
        trace!("reader released");
    }

    // ----------- Driver Callbacks -----------
    fn start_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.started = true;
                self.call_pull_if_needed();
            }
            Err(error) => self.controller_error(error),
        }
    }

    fn pull_settled(&mut self, result: StreamResult<()>) {
        self.pulling = false;
        match result {
            Ok(()) => {
                if self.pull_again {
                    self.pull_again = false;
                    self.call_pull_if_needed();
                }
            }
            Err(error) => self.controller_error(error),
        }
    }
}

// ----------- Controller -----------
/// Handle the source uses to feed its stream.
///
/// The controller does not keep the stream alive: once the stream and its readers are
/// dropped, `enqueue` and `close` fail with a TypeError.
pub struct ReadableStreamDefaultController<T> {
    stream: WeakReadableHandle<T>,
}

impl<T> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: WeakPtr::clone(&self.stream),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(stream: WeakReadableHandle<T>) -> Self {
        Self { stream }
    }

    fn with_stream<R>(&self, f: impl FnOnce(&mut ReadableStreamInner<T>) -> R) -> Option<R> {
        let stream = self.stream.upgrade()?;
        let mut inner = stream.lock();
        Some(f(&mut inner))
    }

    /// `high_water_mark` minus the queued size, or `None` once closed or errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.with_stream(|stream| stream.desired_size()).flatten()
    }

    /// Closes the stream once queued chunks are read. Fails after `close` or `error`.
    pub fn close(&self) -> StreamResult<()> {
        self.with_stream(|stream| stream.controller_close())
            .unwrap_or_else(|| Err(StreamError::detached()))
    }

    /// Queues a chunk, or hands it straight to a waiting read.
    ///
    /// Fails with a TypeError after `close` or `error`. A failing size algorithm errors
    /// the stream and the error is returned.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.with_stream(|stream| stream.controller_enqueue(chunk))
            .unwrap_or_else(|| Err(StreamError::detached()))
    }

    /// Errors the stream. Only the first error is kept.
    pub fn error(&self, error: StreamError) {
        self.with_stream(|stream| stream.controller_error(error));
    }
}

// ----------- Driver -----------
enum Step<O> {
    Done(O),
    Canceled {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    /// The stream closed or errored; `fut` still ran to completion.
    Shutdown,
    /// Every handle to the stream was dropped while `fut` was running.
    Detached,
}

/// Polls `fut` while watching the command channel.
///
/// Only a cancel interrupts `fut`. After a shutdown it is still driven to completion.
async fn run_until_canceled<F: Future>(
    fut: F,
    commands: &mut UnboundedReceiver<SourceCommand>,
) -> Step<F::Output> {
    let mut fut = pin!(fut);
    loop {
        match future::select(fut.as_mut(), commands.next()).await {
            Either::Left((output, _)) => return Step::Done(output),
            Either::Right((command, _)) => match command {
                Some(SourceCommand::Cancel { reason, completion }) => {
                    return Step::Canceled { reason, completion };
                }
                Some(SourceCommand::Shutdown) => {
                    let _ = fut.await;
                    return Step::Shutdown;
                }
                None => return Step::Detached,
                Some(SourceCommand::Pull) => {}
            },
        }
    }
}

fn with_stream<T>(stream: &WeakReadableHandle<T>, f: impl FnOnce(&mut ReadableStreamInner<T>)) {
    if let Some(stream) = stream.upgrade() {
        f(&mut stream.lock());
    }
}

async fn cancel_source<C, S: PullSource<C>>(
    source: &mut S,
    reason: Option<String>,
    completion: oneshot::Sender<StreamResult<()>>,
) {
    let result = source.cancel_source(reason).await;
    let _ = completion.send(result);
}

pub(crate) async fn readable_stream_task<T, C, S>(
    mut source: S,
    mut controller: C,
    stream: WeakReadableHandle<T>,
    mut commands: UnboundedReceiver<SourceCommand>,
) where
    S: PullSource<C>,
{
    let started = run_until_canceled(source.start_source(&mut controller), &mut commands).await;
    match started {
        Step::Done(result) => with_stream(&stream, |stream| stream.start_settled(result)),
        Step::Canceled { reason, completion } => {
            cancel_source(&mut source, reason, completion).await;
            return;
        }
        Step::Shutdown | Step::Detached => return,
    }

    loop {
        match commands.next().await {
            Some(SourceCommand::Pull) => {
                trace!("pulling from source");
                let pulled =
                    run_until_canceled(source.pull_source(&mut controller), &mut commands).await;
                match pulled {
                    Step::Done(result) => with_stream(&stream, |stream| stream.pull_settled(result)),
                    Step::Canceled { reason, completion } => {
                        cancel_source(&mut source, reason, completion).await;
                        break;
                    }
                    Step::Shutdown | Step::Detached => break,
                }
            }
            Some(SourceCommand::Cancel { reason, completion }) => {
                cancel_source(&mut source, reason, completion).await;
                break;
            }
            Some(SourceCommand::Shutdown) | None => break,
        }
    }
    trace!("readable stream driver finished");
}

// ----------- Stream -----------
pub struct ReadableStream<T> {
    pub(crate) inner: ReadableHandle<T>,
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    pub fn builder<Source: ReadableSource<T>>(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }

    /// State and command channel of a default-controlled stream, without a driver.
    pub(crate) fn create_parts(
        strategy: BoxedStrategy<T>,
        high_water_mark: f64,
    ) -> (Self, WeakReadableHandle<T>, UnboundedReceiver<SourceCommand>) {
        let (tx, rx) = unbounded();
        let queue = ChunkQueue::Default {
            queue: QueueWithSizes::default(),
            strategy,
        };
        let inner = SharedPtr::new(Mutex::new(ReadableStreamInner::new(
            queue,
            high_water_mark,
            tx,
        )));
        let weak = SharedPtr::downgrade(&inner);
        (Self { inner }, weak, rx)
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().is_locked()
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Locks the stream to a new default reader.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        let (id, closed) = self
            .inner
            .lock()
            .acquire_reader(ReaderKind::Default(VecDeque::new()))?;
        Ok(ReadableStreamDefaultReader {
            stream: SharedPtr::clone(&self.inner),
            id,
            closed,
        })
    }

    /// Cancels an unlocked stream, resolving once the source's `cancel` finished.
    pub fn cancel(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.is_locked() {
                Outcome::Ready(Err(StreamError::type_error(
                    "Cannot cancel a stream that has a reader",
                )))
            } else {
                inner.cancel(reason)
            }
        };
        outcome.wait()
    }

    /// Async iterator over the stream's chunks. Dropping it early cancels the stream
    /// unless `prevent_cancel` is set.
    pub fn values(&self, prevent_cancel: bool) -> StreamResult<ReadableStreamAsyncIterator<T>> {
        let reader = self.get_reader()?;
        Ok(ReadableStreamAsyncIterator {
            reader: Some(reader),
            pending: None,
            prevent_cancel,
        })
    }
}

impl<T> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("locked", &inner.is_locked())
            .finish()
    }
}

// ----------- Default Reader -----------
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static> {
    stream: ReadableHandle<T>,
    id: u64,
    closed: SharedPtr<Mutex<PromiseSlot<()>>>,
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultReader<T> {
    /// Next chunk, `None` once the stream is closed.
    ///
    /// The request is queued when this is called, not when the future is first polled.
    pub fn read(&self) -> impl Future<Output = StreamResult<Option<T>>> + 'static {
        let outcome = self.stream.lock().read(self.id);
        outcome.wait()
    }

    pub fn closed(&self) -> Promise<()> {
        self.closed.lock().promise()
    }

    pub fn cancel(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = self.stream.lock().reader_cancel(self.id, reason);
        outcome.wait()
    }

    /// Unlocks the stream. Pending reads reject with a TypeError.
    pub fn release_lock(&self) {
        self.stream.lock().release_reader(self.id);
    }

    pub fn is_released(&self) -> bool {
        !self.stream.lock().owns_reader(self.id)
    }
}

impl<T: MaybeSend + 'static> fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader")
            .field("released", &self.is_released())
            .finish()
    }
}

impl<T: MaybeSend + 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        self.stream.lock().release_reader(self.id);
    }
}

// ----------- Async Iterator -----------
pub struct ReadableStreamAsyncIterator<T: MaybeSend + 'static> {
    reader: Option<ReadableStreamDefaultReader<T>>,
    pending: Option<Outcome<Option<T>>>,
    prevent_cancel: bool,
}

impl<T: MaybeSend + 'static> Stream for ReadableStreamAsyncIterator<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(reader) = &this.reader else {
            return Poll::Ready(None);
        };
        let pending = this
            .pending
            .get_or_insert_with(|| reader.stream.lock().read(reader.id));
        let result = match Pin::new(pending).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;
        match result {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                this.reader = None;
                Poll::Ready(None)
            }
            Err(error) => {
                this.reader = None;
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}

impl<T: MaybeSend + 'static> Drop for ReadableStreamAsyncIterator<T> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            if !self.prevent_cancel {
                // Cancellation takes effect when requested; the completion is not awaited.
                let _ = reader.cancel(None);
            }
        }
    }
}

// ----------- Builder -----------
pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source> {
    source: Source,
    strategy: Option<BoxedStrategy<T>>,
}

impl<T: MaybeSend + 'static, Source: ReadableSource<T>> ReadableStreamBuilder<T, Source> {
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: None,
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(
        self,
    ) -> StreamResult<(ReadableStream<T>, impl Future<Output = ()> + MaybeSend + 'static)> {
        let (strategy, high_water_mark) =
            extract_strategy(self.strategy, Box::new(CountQueuingStrategy::new(1.0)))?;
        let (stream, inner, commands) = ReadableStream::create_parts(strategy, high_water_mark);
        let controller = ReadableStreamDefaultController::new(WeakPtr::clone(&inner));
        let driver = readable_stream_task(self.source, controller, inner, commands);
        Ok((stream, driver))
    }

    /// Hand the driver to `spawn_fn` and return the stream
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<T>>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, driver) = self.prepare()?;
        spawn_fn(Box::pin(driver));
        Ok(stream)
    }
}

// ----------- Convenience Sources -----------
pub struct IteratorSource<I> {
    iter: I,
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    T: MaybeSend + 'static,
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        }
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    T: MaybeSend + 'static,
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    pub fn from_vec(items: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        Self::from_iterator(items.into_iter())
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>>
    where
        I: Iterator<Item = T> + MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(IteratorSource { iter })
    }

    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(AsyncStreamSource { stream })
    }
}
