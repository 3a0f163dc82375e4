use super::{
    CountQueuingStrategy, QueuingStrategy,
    error::{StreamError, StreamResult},
    promise::{Outcome, Promise, PromiseSlot, Resolver},
    queue::{QueueWithSizes, extract_strategy, validate_size},
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic, SharedPtr, WeakPtr};
use futures::{
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        oneshot,
    },
    future,
    stream::StreamExt,
};
use parking_lot::Mutex;
use pin_project::pin_project;
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

// ----------- Sink Trait -----------
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Declared sink type. No sink types are defined, so any value fails construction.
    const TYPE: Option<&'static str> = None;

    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink after every queued write succeeded
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(()))
    }

    /// Abort the sink
    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

pub(crate) enum SinkCommand<T> {
    Write(T),
    Close,
    Abort(Option<String>),
    Shutdown,
}

type Request = oneshot::Sender<StreamResult<()>>;

enum QueueEntry<T> {
    Chunk(T),
    /// Placeholder for the chunk handed to the sink.
    InFlight,
    Close,
}

struct PendingAbort {
    waiters: Vec<Request>,
    reason: Option<String>,
    was_already_erroring: bool,
}

struct WriterPromises {
    ready: PromiseSlot<()>,
    closed: PromiseSlot<()>,
}

struct WriterRecord {
    id: u64,
    promises: SharedPtr<Mutex<WriterPromises>>,
}

pub(crate) type WritableHandle<T> = SharedPtr<Mutex<WritableStreamInner<T>>>;

/// Held by the driver, so dropping the stream and its writer closes the command channel.
pub(crate) type WeakWritableHandle<T> = WeakPtr<Mutex<WritableStreamInner<T>>>;

// ----------- Stream State -----------
pub(crate) struct WritableStreamInner<T> {
    state: WritableState,
    stored_error: Option<StreamError>,
    writer: Option<WriterRecord>,
    next_writer_id: u64,
    write_requests: VecDeque<Request>,
    in_flight_write: Option<Request>,
    close_request: Option<Request>,
    in_flight_close: Option<Request>,
    pending_abort: Option<PendingAbort>,
    aborting: Vec<Request>,
    backpressure: bool,
    queue: QueueWithSizes<QueueEntry<T>>,
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
    started: bool,
    algorithms_cleared: bool,
    abort_signal: Resolver<Option<String>>,
    commands: UnboundedSender<SinkCommand<T>>,
}

impl<T> WritableStreamInner<T> {
    fn new(
        strategy: BoxedStrategy<T>,
        high_water_mark: f64,
        abort_signal: Resolver<Option<String>>,
        commands: UnboundedSender<SinkCommand<T>>,
    ) -> Self {
        Self {
            state: WritableState::Writable,
            stored_error: None,
            writer: None,
            next_writer_id: 0,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            aborting: Vec::new(),
            backpressure: high_water_mark <= 0.0,
            queue: QueueWithSizes::default(),
            strategy,
            high_water_mark,
            started: false,
            algorithms_cleared: false,
            abort_signal,
            commands,
        }
    }

    fn is_locked(&self) -> bool {
        self.writer.is_some()
    }

    fn owns_writer(&self, id: u64) -> bool {
        self.writer.as_ref().is_some_and(|writer| writer.id == id)
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("The stream is errored"))
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn with_writer_promises(&self, f: impl FnOnce(&mut WriterPromises)) {
        if let Some(writer) = &self.writer {
            f(&mut writer.promises.lock());
        }
    }

    // ----------- Abort / Close -----------
    fn abort(&mut self, reason: Option<String>) -> Outcome<()> {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return Outcome::Ready(Ok(()));
        }
        self.abort_signal.resolve(reason.clone());
        let (waiter, outcome) = Outcome::channel();
        if let Some(pending) = &mut self.pending_abort {
            pending.waiters.push(waiter);
            return outcome;
        }
        let was_already_erroring = self.state == WritableState::Erroring;
        let reason = if was_already_erroring { None } else { reason };
        debug!(?reason, "aborting writable stream");
        self.pending_abort = Some(PendingAbort {
            waiters: vec![waiter],
            reason: reason.clone(),
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(StreamError::Aborted(reason));
        }
        outcome
    }

    fn close(&mut self) -> Outcome<()> {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return Outcome::Ready(Err(StreamError::type_error(
                "The stream is closed or errored",
            )));
        }
        let (request, outcome) = Outcome::channel();
        self.close_request = Some(request);
        if self.backpressure && self.state == WritableState::Writable {
            self.with_writer_promises(|promises| promises.ready.resolve(()));
        }
        self.queue.enqueue(QueueEntry::Close, 0.0);
        self.advance_queue_if_needed();
        outcome
    }

    // ----------- Erroring -----------
    fn start_erroring(&mut self, reason: StreamError) {
        debug!(error = %reason, "writable stream erroring");
        self.stored_error = Some(reason.clone());
        self.state = WritableState::Erroring;
        self.with_writer_promises(|promises| promises.ready.ensure_rejected(reason));
        if !self.has_operation_marked_in_flight() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        self.state = WritableState::Errored;
        debug!("writable stream errored");
        self.queue.reset();
        let stored = self.stored_error();
        for request in self.write_requests.drain(..) {
            let _ = request.send(Err(stored.clone()));
        }
        let Some(pending) = self.pending_abort.take() else {
            self.reject_close_and_closed_promise_if_needed();
            self.clear_algorithms();
            return;
        };
        if pending.was_already_erroring {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(stored.clone()));
            }
            self.reject_close_and_closed_promise_if_needed();
            self.clear_algorithms();
            return;
        }
        self.aborting = pending.waiters;
        if self.algorithms_cleared {
            self.abort_settled(Ok(()));
            return;
        }
        let _ = self.commands.unbounded_send(SinkCommand::Abort(pending.reason));
        self.clear_algorithms();
    }

    fn abort_settled(&mut self, result: StreamResult<()>) {
        for waiter in self.aborting.drain(..) {
            let _ = waiter.send(result.clone());
        }
        self.reject_close_and_closed_promise_if_needed();
    }

    fn reject_close_and_closed_promise_if_needed(&mut self) {
        let stored = self.stored_error();
        if let Some(request) = self.close_request.take() {
            let _ = request.send(Err(stored.clone()));
        }
        self.with_writer_promises(|promises| promises.closed.reject(stored));
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.start_erroring(error);
        } else {
            self.finish_erroring();
        }
    }

    // ----------- In-flight Bookkeeping -----------
    fn finish_in_flight_write(&mut self) {
        if let Some(request) = self.in_flight_write.take() {
            let _ = request.send(Ok(()));
        }
    }

    fn finish_in_flight_write_with_error(&mut self, error: StreamError) {
        if let Some(request) = self.in_flight_write.take() {
            let _ = request.send(Err(error.clone()));
        }
        self.deal_with_rejection(error);
    }

    fn finish_in_flight_close(&mut self) {
        if let Some(request) = self.in_flight_close.take() {
            let _ = request.send(Ok(()));
        }
        if self.state == WritableState::Erroring {
            self.stored_error = None;
            if let Some(pending) = self.pending_abort.take() {
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
        self.state = WritableState::Closed;
        debug!("writable stream closed");
        self.with_writer_promises(|promises| promises.closed.resolve(()));
    }

    fn finish_in_flight_close_with_error(&mut self, error: StreamError) {
        if let Some(request) = self.in_flight_close.take() {
            let _ = request.send(Err(error.clone()));
        }
        if let Some(pending) = self.pending_abort.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        self.deal_with_rejection(error);
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        if self.backpressure != backpressure {
            self.with_writer_promises(|promises| {
                if backpressure {
                    promises.ready = PromiseSlot::pending();
                } else {
                    promises.ready.resolve(());
                }
            });
        }
        self.backpressure = backpressure;
    }

    // ----------- Controller Operations -----------
    fn desired_size(&self) -> f64 {
        self.high_water_mark - self.queue.total_size()
    }

    fn get_backpressure(&self) -> bool {
        self.desired_size() <= 0.0
    }

    fn clear_algorithms(&mut self) {
        if !self.algorithms_cleared {
            self.algorithms_cleared = true;
            let _ = self.commands.unbounded_send(SinkCommand::Shutdown);
        }
    }

    fn error_if_needed(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.clear_algorithms();
            self.start_erroring(error);
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.in_flight_write.is_some() {
            return;
        }
        match self.state {
            WritableState::Closed | WritableState::Errored => return,
            WritableState::Erroring => {
                self.finish_erroring();
                return;
            }
            WritableState::Writable => {}
        }
        match self.queue.peek() {
            None | Some(QueueEntry::InFlight) => {}
            Some(QueueEntry::Close) => self.process_close(),
            Some(QueueEntry::Chunk(_)) => self.process_write(),
        }
    }

    fn process_close(&mut self) {
        self.in_flight_close = self.close_request.take();
        self.queue.dequeue();
        trace!("closing sink");
        let _ = self.commands.unbounded_send(SinkCommand::Close);
        self.clear_algorithms();
    }

    fn process_write(&mut self) {
        let Some(entry) = self.queue.peek_mut() else {
            return;
        };
        let QueueEntry::Chunk(chunk) = std::mem::replace(entry, QueueEntry::InFlight) else {
            return;
        };
        self.in_flight_write = self.write_requests.pop_front();
        trace!("dispatching write to sink");
        let _ = self.commands.unbounded_send(SinkCommand::Write(chunk));
    }

    fn write(&mut self, chunk: T, size: f64) {
        let size = match validate_size(Some(size)) {
            Ok(size) => size,
            Err(error) => {
                self.error_if_needed(error);
                return;
            }
        };
        self.queue.enqueue(QueueEntry::Chunk(chunk), size);
        if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
            let backpressure = self.get_backpressure();
            self.update_backpressure(backpressure);
        }
        self.advance_queue_if_needed();
    }

    // ----------- Driver Callbacks -----------
    fn start_settled(&mut self, result: StreamResult<()>) {
        self.started = true;
        match result {
            Ok(()) => self.advance_queue_if_needed(),
            Err(error) => self.deal_with_rejection(error),
        }
    }

    fn write_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.finish_in_flight_write();
                self.queue.dequeue();
                if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
                    let backpressure = self.get_backpressure();
                    self.update_backpressure(backpressure);
                }
                self.advance_queue_if_needed();
            }
            Err(error) => {
                if self.state == WritableState::Writable {
                    self.clear_algorithms();
                }
                self.finish_in_flight_write_with_error(error);
            }
        }
    }

    fn close_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => self.finish_in_flight_close(),
            Err(error) => self.finish_in_flight_close_with_error(error),
        }
    }

    // ----------- Writer Operations -----------
    fn acquire_writer(&mut self) -> StreamResult<(u64, SharedPtr<Mutex<WriterPromises>>)> {
        if self.is_locked() {
            return Err(StreamError::type_error("WritableStream is locked"));
        }
        let promises = match self.state {
            WritableState::Writable => WriterPromises {
                ready: if !self.close_queued_or_in_flight() && self.backpressure {
                    PromiseSlot::pending()
                } else {
                    PromiseSlot::resolved(())
                },
                closed: PromiseSlot::pending(),
            },
            WritableState::Erroring => WriterPromises {
                ready: PromiseSlot::rejected(self.stored_error()),
                closed: PromiseSlot::pending(),
            },
            WritableState::Closed => WriterPromises {
                ready: PromiseSlot::resolved(()),
                closed: PromiseSlot::resolved(()),
            },
            WritableState::Errored => WriterPromises {
                ready: PromiseSlot::rejected(self.stored_error()),
                closed: PromiseSlot::rejected(self.stored_error()),
            },
        };
        let promises = SharedPtr::new(Mutex::new(promises));
        let id = self.next_writer_id;
        self.next_writer_id += 1;
        self.writer = Some(WriterRecord {
            id,
            promises: SharedPtr::clone(&promises),
        });
        Ok((id, promises))
    }

    fn release_writer(&mut self, writer_id: u64) {
        if !self.owns_writer(writer_id) {
            return;
        }
        let released = StreamError::type_error("Writer was released");
        self.with_writer_promises(|promises| {
            promises.ready.ensure_rejected(released.clone());
            promises.closed.ensure_rejected(released);
        });
        self.writer = None;
        trace!("writer released");
    }

    fn writer_write(&mut self, writer_id: u64, chunk: T) -> Outcome<()> {
        let size = match self.strategy.size(&chunk) {
            Ok(Some(size)) => size,
            // Rejected as a RangeError once the chunk reaches the queue.
            Ok(None) => f64::NAN,
            Err(error) => {
                self.error_if_needed(error);
                1.0
            }
        };
        if !self.owns_writer(writer_id) {
            return Outcome::Ready(Err(StreamError::released()));
        }
        match self.state {
            WritableState::Errored | WritableState::Erroring => {
                return Outcome::Ready(Err(self.stored_error()));
            }
            WritableState::Closed => {
                return Outcome::Ready(Err(StreamError::type_error(
                    "The stream is closing or closed",
                )));
            }
            WritableState::Writable if self.close_queued_or_in_flight() => {
                return Outcome::Ready(Err(StreamError::type_error(
                    "The stream is closing or closed",
                )));
            }
            WritableState::Writable => {}
        }
        let (request, outcome) = Outcome::channel();
        self.write_requests.push_back(request);
        self.write(chunk, size);
        outcome
    }

    fn writer_close(&mut self, writer_id: u64) -> Outcome<()> {
        if !self.owns_writer(writer_id) {
            return Outcome::Ready(Err(StreamError::released()));
        }
        if self.close_queued_or_in_flight() {
            return Outcome::Ready(Err(StreamError::type_error("The stream is already closing")));
        }
        self.close()
    }

    fn writer_abort(&mut self, writer_id: u64, reason: Option<String>) -> Outcome<()> {
        if !self.owns_writer(writer_id) {
            return Outcome::Ready(Err(StreamError::released()));
        }
        self.abort(reason)
    }

    fn writer_desired_size(&self, writer_id: u64) -> StreamResult<Option<f64>> {
        if !self.owns_writer(writer_id) {
            return Err(StreamError::released());
        }
        Ok(match self.state {
            WritableState::Writable => Some(self.desired_size()),
            WritableState::Erroring | WritableState::Errored | WritableState::Closed => None,
        })
    }
}

/// Type-erased view of a writable stream used by its controller and by transform streams.
pub(crate) trait WritableControl: MaybeSend + MaybeSync {
    fn error_if_needed(&self, error: StreamError);

    /// Stored error while the stream is erroring.
    fn erroring_error(&self) -> Option<StreamError>;

    /// Stored error once the stream is errored.
    fn errored_error(&self) -> Option<StreamError>;
}

impl<T: MaybeSend + 'static> WritableControl for Mutex<WritableStreamInner<T>> {
    fn error_if_needed(&self, error: StreamError) {
        self.lock().error_if_needed(error);
    }

    fn erroring_error(&self) -> Option<StreamError> {
        let inner = self.lock();
        (inner.state == WritableState::Erroring).then(|| inner.stored_error())
    }

    fn errored_error(&self) -> Option<StreamError> {
        let inner = self.lock();
        (inner.state == WritableState::Errored).then(|| inner.stored_error())
    }
}

// ----------- Controller -----------
pub struct WritableStreamDefaultController {
    stream: WeakPtr<dyn WritableControl>,
    signal: Promise<Option<String>>,
}

impl WritableStreamDefaultController {
    pub(crate) fn new(stream: WeakPtr<dyn WritableControl>, signal: Promise<Option<String>>) -> Self {
        Self { stream, signal }
    }

    /// Errors the stream unless it already left the writable state.
    pub fn error(&self, error: StreamError) {
        if let Some(stream) = self.stream.upgrade() {
            stream.error_if_needed(error);
        }
    }

    /// Resolves with the abort reason once the stream is aborted.
    pub fn signal(&self) -> Promise<Option<String>> {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        !self.signal.is_pending()
    }

    /// Races `fut` against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted(reason))`.
    ///
    /// ```ignore
    /// async fn write(
    ///     &mut self,
    ///     chunk: Vec<u8>,
    ///     controller: &mut WritableStreamDefaultController,
    /// ) -> StreamResult<()> {
    ///     controller
    ///         .with_abort(async move {
    ///             tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    ///             Ok(())
    ///         })
    ///         .await
    /// }
    /// ```
    pub fn with_abort<F, O>(&self, fut: F) -> WithAbort<F>
    where
        F: Future<Output = StreamResult<O>>,
    {
        WithAbort {
            fut,
            signal: self.signal.clone(),
        }
    }
}

#[pin_project]
pub struct WithAbort<F> {
    #[pin]
    fut: F,
    signal: Promise<Option<String>>,
}

impl<F, O> Future for WithAbort<F>
where
    F: Future<Output = StreamResult<O>>,
{
    type Output = StreamResult<O>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(reason) = Pin::new(this.signal).poll(cx) {
            return Poll::Ready(Err(StreamError::Aborted(reason.ok().flatten())));
        }
        this.fut.poll(cx)
    }
}

// ----------- Driver -----------
fn with_stream<T>(stream: &WeakWritableHandle<T>, f: impl FnOnce(&mut WritableStreamInner<T>)) {
    if let Some(stream) = stream.upgrade() {
        f(&mut stream.lock());
    }
}

pub(crate) async fn writable_stream_task<T, S>(
    mut sink: S,
    mut controller: WritableStreamDefaultController,
    stream: WeakWritableHandle<T>,
    mut commands: UnboundedReceiver<SinkCommand<T>>,
) where
    T: MaybeSend + 'static,
    S: WritableSink<T>,
{
    let started = sink.start(&mut controller).await;
    with_stream(&stream, |stream| stream.start_settled(started));

    let mut sink = Some(sink);
    while let Some(command) = commands.next().await {
        match command {
            SinkCommand::Write(chunk) => {
                let Some(sink) = sink.as_mut() else {
                    break;
                };
                let result = sink.write(chunk, &mut controller).await;
                with_stream(&stream, |stream| stream.write_settled(result));
            }
            SinkCommand::Close => {
                let Some(sink) = sink.take() else {
                    break;
                };
                let result = sink.close().await;
                with_stream(&stream, |stream| stream.close_settled(result));
            }
            SinkCommand::Abort(reason) => {
                let result = match sink.as_mut() {
                    Some(sink) => sink.abort(reason).await,
                    None => Ok(()),
                };
                with_stream(&stream, |stream| stream.abort_settled(result));
            }
            SinkCommand::Shutdown => break,
        }
    }
    trace!("writable stream driver finished");
}

// ----------- Stream -----------
pub struct WritableStream<T> {
    pub(crate) inner: WritableHandle<T>,
}

impl<T: MaybeSend + 'static> WritableStream<T> {
    pub fn builder<Sink: WritableSink<T>>(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder {
            sink,
            strategy: None,
        }
    }

    /// State, controller and command channel of a writable stream, without a driver.
    pub(crate) fn create_parts(
        strategy: BoxedStrategy<T>,
        high_water_mark: f64,
    ) -> (
        Self,
        WritableStreamDefaultController,
        UnboundedReceiver<SinkCommand<T>>,
    ) {
        let (tx, rx) = unbounded();
        let (signal, abort_signal) = Promise::pending();
        let inner = SharedPtr::new(Mutex::new(WritableStreamInner::new(
            strategy,
            high_water_mark,
            abort_signal,
            tx,
        )));
        let control: WeakPtr<dyn WritableControl> = { let weak = SharedPtr::downgrade(&inner); weak };
        let controller = WritableStreamDefaultController::new(control, signal);
        (Self { inner }, controller, rx)
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().is_locked()
    }

    pub fn state(&self) -> WritableState {
        self.inner.lock().state
    }

    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        let (id, promises) = self.inner.lock().acquire_writer()?;
        Ok(WritableStreamDefaultWriter {
            stream: SharedPtr::clone(&self.inner),
            id,
            promises,
            pending_ready: None,
            last_write: None,
            closing: None,
        })
    }

    /// Aborts an unlocked stream.
    pub fn abort(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.is_locked() {
                Outcome::Ready(Err(StreamError::type_error(
                    "Cannot abort a stream that has a writer",
                )))
            } else {
                inner.abort(reason)
            }
        };
        outcome.wait()
    }

    /// Closes an unlocked stream once queued writes finish.
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.is_locked() {
                Outcome::Ready(Err(StreamError::type_error(
                    "Cannot close a stream that has a writer",
                )))
            } else if inner.close_queued_or_in_flight() {
                Outcome::Ready(Err(StreamError::type_error("The stream is already closing")))
            } else {
                inner.close()
            }
        };
        outcome.wait()
    }
}

impl<T> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("locked", &inner.is_locked())
            .finish()
    }
}

// ----------- Writer -----------
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static> {
    stream: WritableHandle<T>,
    id: u64,
    promises: SharedPtr<Mutex<WriterPromises>>,
    pending_ready: Option<Promise<()>>,
    last_write: Option<Outcome<()>>,
    closing: Option<Outcome<()>>,
}

impl<T: MaybeSend + 'static> WritableStreamDefaultWriter<T> {
    /// Queues `chunk`; the future settles when the sink finished writing it.
    ///
    /// Writes are queued at the call, so they reach the sink in call order even if the
    /// returned futures are never polled.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = self.stream.lock().writer_write(self.id, chunk);
        outcome.wait()
    }

    pub fn close(&self) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = self.stream.lock().writer_close(self.id);
        outcome.wait()
    }

    pub fn abort(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + 'static {
        let outcome = self.stream.lock().writer_abort(self.id, reason);
        outcome.wait()
    }

    /// Pending while the stream applies backpressure.
    pub fn ready(&self) -> Promise<()> {
        self.promises.lock().ready.promise()
    }

    pub fn closed(&self) -> Promise<()> {
        self.promises.lock().closed.promise()
    }

    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        self.stream.lock().writer_desired_size(self.id)
    }

    pub fn release_lock(&self) {
        self.stream.lock().release_writer(self.id);
    }
}

impl<T: MaybeSend + 'static> fmt::Debug for WritableStreamDefaultWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let released = !self.stream.lock().owns_writer(self.id);
        f.debug_struct("WritableStreamDefaultWriter")
            .field("released", &released)
            .finish()
    }
}

impl<T: MaybeSend + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.stream.lock().release_writer(self.id);
    }
}

impl<T: MaybeSend + 'static> futures::Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let ready = this
            .pending_ready
            .get_or_insert_with(|| this.promises.lock().ready.promise());
        let result = match Pin::new(ready).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending_ready = None;
        Poll::Ready(result)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let outcome = this.stream.lock().writer_write(this.id, item);
        if let Outcome::Ready(Err(error)) = outcome {
            return Err(error);
        }
        this.last_write = Some(outcome);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let Some(last_write) = this.last_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = match Pin::new(last_write).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.last_write = None;
        Poll::Ready(result)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let closing = this
            .closing
            .get_or_insert_with(|| this.stream.lock().writer_close(this.id));
        let result = match Pin::new(closing).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.closing = None;
        this.last_write = None;
        Poll::Ready(result)
    }
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: Option<BoxedStrategy<T>>,
}

impl<T: MaybeSend + 'static, Sink: WritableSink<T>> WritableStreamBuilder<T, Sink> {
    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(
        self,
    ) -> StreamResult<(WritableStream<T>, impl Future<Output = ()> + MaybeSend + 'static)> {
        if Sink::TYPE.is_some() {
            return Err(StreamError::range_error("Invalid type is specified"));
        }
        let (strategy, high_water_mark) =
            extract_strategy(self.strategy, Box::new(CountQueuingStrategy::new(1.0)))?;
        let (stream, controller, commands) = WritableStream::create_parts(strategy, high_water_mark);
        let driver = writable_stream_task(
            self.sink,
            controller,
            SharedPtr::downgrade(&stream.inner),
            commands,
        );
        Ok((stream, driver))
    }

    /// Hand the driver to `spawn_fn` and return the stream
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T>>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, driver) = self.prepare()?;
        spawn_fn(Box::pin(driver));
        Ok(stream)
    }
}
