use super::{
    CountQueuingStrategy, QueuingStrategy,
    error::{StreamError, StreamResult},
    promise::{Promise, PromiseSlot, Resolver},
    queue::extract_strategy,
    readable::{
        ReadableSource, ReadableStream, ReadableStreamDefaultController, ReadableStreamInner,
        StreamState, WeakReadableHandle, readable_stream_task,
    },
    writable::{
        WritableControl, WritableSink, WritableStream, WritableStreamDefaultController,
        writable_stream_task,
    },
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, SharedPtr, WeakPtr};
use futures::{future, lock::Mutex as AsyncMutex};
use parking_lot::Mutex;
use std::{future::Future, marker::PhantomData};
use tracing::{debug, trace};

/// Transformer trait
///
/// Calls never overlap. A readable-side `cancel` waits until an in-flight `transform`
/// or `flush` settles, so those must not wait on anything only a cancel would release.
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    /// Called once when the transform stream is created
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called when the readable side is canceled or the writable side aborted
    fn cancel(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

struct TransformState {
    backpressure: bool,
    backpressure_change: PromiseSlot<()>,
    /// Settles once flush, cancel or abort ran; later callers share its outcome.
    finish: Option<Promise<()>>,
}

struct TransformCore {
    state: Mutex<TransformState>,
    writable: WeakPtr<dyn WritableControl>,
}

impl TransformCore {
    fn new(writable: WeakPtr<dyn WritableControl>) -> Self {
        Self {
            state: Mutex::new(TransformState {
                backpressure: true,
                backpressure_change: PromiseSlot::pending(),
                finish: None,
            }),
            writable,
        }
    }

    /// Flips the flag and returns the promise for the next change.
    fn set_backpressure(&self, backpressure: bool) -> Promise<()> {
        let mut state = self.state.lock();
        state.backpressure_change.resolve(());
        state.backpressure_change = PromiseSlot::pending();
        state.backpressure = backpressure;
        state.backpressure_change.promise()
    }

    /// Promise a write must wait on before transforming, if backpressure is applied.
    fn backpressure_wait(&self) -> Option<Promise<()>> {
        let state = self.state.lock();
        state
            .backpressure
            .then(|| state.backpressure_change.promise())
    }

    fn backpressure(&self) -> bool {
        self.state.lock().backpressure
    }

    /// Settles the pending change promise so a parked pull returns.
    fn release_pull(&self) {
        self.state.lock().backpressure_change.resolve(());
    }

    fn unblock_write(&self) {
        if self.backpressure() {
            self.set_backpressure(false);
        }
    }

    fn error_writable_and_unblock_write(&self, error: StreamError) {
        if let Some(writable) = self.writable.upgrade() {
            writable.error_if_needed(error);
        }
        self.unblock_write();
    }

    fn writable_erroring_error(&self) -> Option<StreamError> {
        self.writable.upgrade()?.erroring_error()
    }

    fn writable_errored_error(&self) -> Option<StreamError> {
        self.writable.upgrade()?.errored_error()
    }

    /// Claims the finish slot, or returns the promise of whoever claimed it first.
    fn begin_finish(&self) -> Result<Resolver<()>, Promise<()>> {
        let mut state = self.state.lock();
        if let Some(finish) = &state.finish {
            return Err(finish.clone());
        }
        let (promise, resolver) = Promise::pending();
        state.finish = Some(promise);
        Ok(resolver)
    }
}

fn settle_finish(resolver: Resolver<()>, result: StreamResult<()>) -> StreamResult<()> {
    match &result {
        Ok(()) => resolver.resolve(()),
        Err(error) => resolver.reject(error.clone()),
    }
    result
}

// ----------- Controller -----------
pub struct TransformStreamDefaultController<O> {
    readable: WeakReadableHandle<O>,
    core: SharedPtr<TransformCore>,
}

impl<O> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: WeakPtr::clone(&self.readable),
            core: SharedPtr::clone(&self.core),
        }
    }
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    fn with_readable<R>(&self, f: impl FnOnce(&mut ReadableStreamInner<O>) -> R) -> Option<R> {
        let readable = self.readable.upgrade()?;
        let mut inner = readable.lock();
        Some(f(&mut inner))
    }

    /// Desired size of the readable side's queue.
    pub fn desired_size(&self) -> Option<f64> {
        self.with_readable(|readable| readable.desired_size()).flatten()
    }

    /// Enqueue to readable side
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        let Some(readable) = self.readable.upgrade() else {
            return Err(StreamError::detached());
        };
        let backpressure = {
            let mut readable = readable.lock();
            if !readable.can_close_or_enqueue() {
                return Err(StreamError::type_error(
                    "Readable side is not in a state that permits enqueue",
                ));
            }
            if let Err(error) = readable.controller_enqueue(chunk) {
                let stored = readable.stored_error.clone().unwrap_or(error.clone());
                drop(readable);
                self.core.release_pull();
                self.core.error_writable_and_unblock_write(error);
                return Err(stored);
            }
            readable.has_backpressure()
        };
        if backpressure && !self.core.backpressure() {
            self.core.set_backpressure(true);
        }
        Ok(())
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) {
        debug!(%error, "transform stream errored");
        self.error_readable(error.clone());
        self.core.error_writable_and_unblock_write(error);
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) {
        debug!("transform stream terminated");
        self.close_readable();
        self.core
            .error_writable_and_unblock_write(StreamError::type_error("TransformStream terminated"));
    }

    fn close_readable(&self) {
        self.with_readable(|readable| {
            if readable.can_close_or_enqueue() {
                let _ = readable.controller_close();
            }
        });
        self.core.release_pull();
    }

    fn error_readable(&self, error: StreamError) {
        self.with_readable(|readable| readable.controller_error(error));
        self.core.release_pull();
    }

    fn readable_errored(&self) -> Option<StreamError> {
        self.with_readable(|readable| {
            (readable.state == StreamState::Errored).then(|| readable.stored_error())
        })
        .flatten()
    }
}

type SharedTransformer<Tr> = SharedPtr<AsyncMutex<Tr>>;

// ----------- Writable Half -----------
struct TransformSink<I, O, Tr> {
    transformer: SharedTransformer<Tr>,
    controller: TransformStreamDefaultController<O>,
    started: Resolver<()>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, Tr> TransformSink<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn perform_transform(&mut self, chunk: I) -> StreamResult<()> {
        trace!("transforming chunk");
        let mut transformer = self.transformer.lock().await;
        let result = transformer.transform(chunk, &mut self.controller).await;
        if let Err(error) = &result {
            self.controller.error(error.clone());
        }
        result
    }
}

impl<I, O, Tr> WritableSink<I> for TransformSink<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn start(&mut self, _: &mut WritableStreamDefaultController) -> StreamResult<()> {
        let result = self.transformer.lock().await.start(&mut self.controller).await;
        match &result {
            Ok(()) => self.started.resolve(()),
            Err(error) => self.started.reject(error.clone()),
        }
        result
    }

    async fn write(&mut self, chunk: I, _: &mut WritableStreamDefaultController) -> StreamResult<()> {
        if let Some(change) = self.controller.core.backpressure_wait() {
            let _ = change.await;
            if let Some(error) = self.controller.core.writable_erroring_error() {
                return Err(error);
            }
        }
        self.perform_transform(chunk).await
    }

    async fn close(mut self) -> StreamResult<()> {
        let resolver = match self.controller.core.begin_finish() {
            Ok(resolver) => resolver,
            Err(finish) => return finish.await,
        };
        let flushed = self.transformer.lock().await.flush(&mut self.controller).await;
        let result = match flushed {
            Ok(()) => match self.controller.readable_errored() {
                Some(error) => Err(error),
                None => {
                    self.controller.close_readable();
                    Ok(())
                }
            },
            Err(error) => {
                self.controller.error_readable(error.clone());
                Err(error)
            }
        };
        settle_finish(resolver, result)
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        let resolver = match self.controller.core.begin_finish() {
            Ok(resolver) => resolver,
            Err(finish) => return finish.await,
        };
        let canceled = self.transformer.lock().await.cancel(reason.clone()).await;
        let result = match canceled {
            Ok(()) => match self.controller.readable_errored() {
                Some(error) => Err(error),
                None => {
                    self.controller.error_readable(StreamError::Aborted(reason));
                    Ok(())
                }
            },
            Err(error) => {
                self.controller.error_readable(error.clone());
                Err(error)
            }
        };
        settle_finish(resolver, result)
    }
}

// ----------- Readable Half -----------
struct TransformSource<I, O, Tr> {
    transformer: SharedTransformer<Tr>,
    controller: TransformStreamDefaultController<O>,
    started: Promise<()>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, Tr> ReadableSource<O> for TransformSource<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn start(&mut self, _: &mut ReadableStreamDefaultController<O>) -> StreamResult<()> {
        self.started.clone().await
    }

    /// Lifts backpressure and stays pending until the transformer enqueues again.
    async fn pull(&mut self, _: &mut ReadableStreamDefaultController<O>) -> StreamResult<()> {
        let change = self.controller.core.set_backpressure(false);
        change.await
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        let resolver = match self.controller.core.begin_finish() {
            Ok(resolver) => resolver,
            Err(finish) => return finish.await,
        };
        let canceled = self.transformer.lock().await.cancel(reason.clone()).await;
        let core = &self.controller.core;
        let result = match canceled {
            Ok(()) => match core.writable_errored_error() {
                Some(error) => Err(error),
                None => {
                    core.error_writable_and_unblock_write(StreamError::Canceled(reason));
                    Ok(())
                }
            },
            Err(error) => {
                core.error_writable_and_unblock_write(error.clone());
                Err(error)
            }
        };
        settle_finish(resolver, result)
    }
}

// ----------- Stream -----------
pub struct TransformStream<I, O> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    pub fn builder<Tr: Transformer<I, O>>(transformer: Tr) -> TransformStreamBuilder<I, O, Tr> {
        TransformStreamBuilder {
            transformer,
            writable_strategy: None,
            readable_strategy: None,
        }
    }

    /// Get the readable side
    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    /// Get the writable side
    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    /// Split into both sides
    pub fn split(self) -> (ReadableStream<O>, WritableStream<I>) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// Passes every chunk through unchanged.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer> {
        Self::builder(IdentityTransformer)
    }
}

pub struct TransformStreamBuilder<I: MaybeSend + 'static, O: MaybeSend + 'static, Tr> {
    transformer: Tr,
    writable_strategy: Option<BoxedStrategy<I>>,
    readable_strategy: Option<BoxedStrategy<O>>,
}

impl<I, O, Tr> TransformStreamBuilder<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    /// Strategy of the writable side. Defaults to a count strategy with high water mark 1.
    pub fn writable_strategy<S: QueuingStrategy<I> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.writable_strategy = Some(Box::new(strategy));
        self
    }

    /// Strategy of the readable side. Defaults to a count strategy with high water mark 0.
    pub fn readable_strategy<S: QueuingStrategy<O> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.readable_strategy = Some(Box::new(strategy));
        self
    }

    /// Return stream + driver future (both halves) without spawning
    pub fn prepare(
        self,
    ) -> StreamResult<(TransformStream<I, O>, impl Future<Output = ()> + MaybeSend + 'static)> {
        let (writable_strategy, writable_hwm) =
            extract_strategy(self.writable_strategy, Box::new(CountQueuingStrategy::new(1.0)))?;
        let (readable_strategy, readable_hwm) =
            extract_strategy(self.readable_strategy, Box::new(CountQueuingStrategy::new(0.0)))?;

        let (readable, readable_handle, source_commands) =
            ReadableStream::create_parts(readable_strategy, readable_hwm);
        let (writable, writable_controller, sink_commands) =
            WritableStream::create_parts(writable_strategy, writable_hwm);

        let writable_control: WeakPtr<dyn WritableControl> = { let weak = SharedPtr::downgrade(&writable.inner); weak };
        let controller = TransformStreamDefaultController {
            readable: WeakPtr::clone(&readable_handle),
            core: SharedPtr::new(TransformCore::new(writable_control)),
        };
        let transformer = SharedPtr::new(AsyncMutex::new(self.transformer));
        let (started, started_resolver) = Promise::pending();

        let sink = TransformSink {
            transformer: SharedPtr::clone(&transformer),
            controller: controller.clone(),
            started: started_resolver,
            _input: PhantomData,
        };
        let source = TransformSource {
            transformer,
            controller,
            started,
            _input: PhantomData::<fn(I)>,
        };

        let readable_driver = readable_stream_task(
            source,
            ReadableStreamDefaultController::new(WeakPtr::clone(&readable_handle)),
            readable_handle,
            source_commands,
        );
        let writable_driver = writable_stream_task(
            sink,
            writable_controller,
            SharedPtr::downgrade(&writable.inner),
            sink_commands,
        );
        let driver = async move {
            future::join(readable_driver, writable_driver).await;
        };
        Ok((TransformStream { readable, writable }, driver))
    }

    /// Hand the driver to `spawn_fn` and return the stream
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<TransformStream<I, O>>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, driver) = self.prepare()?;
        spawn_fn(Box::pin(driver));
        Ok(stream)
    }
}

/// Identity transformer - passes chunks through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer {
    async fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk)
    }
}
