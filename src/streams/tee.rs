//! `ReadableStream::tee`: one source reader feeding two independent branches.
//!
//! A coordinator task owns the reads. Branch pulls only post a request to it, so a
//! branch canceled mid-pull never strands the other branch. Each chunk is cloned into
//! every branch that is still open; the slower branch buffers without bound.

use super::{
    CountQueuingStrategy,
    error::{StreamError, StreamResult},
    promise::{Promise, Resolver},
    readable::{
        ReadableSource, ReadableStream, ReadableStreamDefaultController,
        ReadableStreamDefaultReader, SourceCommand, WeakReadableHandle, readable_stream_task,
    },
};
use crate::platform::{MaybeSend, PlatformBoxFutureStatic, SharedPtr, WeakPtr};
use futures::{
    FutureExt, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{self, Either},
};
use parking_lot::Mutex;
use tracing::{debug, trace};

struct TeeState {
    canceled: [bool; 2],
    reasons: [Option<String>; 2],
    /// Set once the source closed or errored; later cancels have nothing to forward.
    finished: bool,
}

struct TeeShared<T: MaybeSend + 'static> {
    reader: ReadableStreamDefaultReader<T>,
    branches: [ReadableStreamDefaultController<T>; 2],
    state: Mutex<TeeState>,
    cancel_promise: Promise<()>,
    cancel_resolver: Resolver<()>,
}

impl<T: Clone + MaybeSend + 'static> TeeShared<T> {
    fn enqueue(&self, chunk: T) {
        let canceled = self.state.lock().canceled;
        let mut chunk = Some(chunk);
        for (index, branch) in self.branches.iter().enumerate() {
            if canceled[index] {
                continue;
            }
            let copy = if index == 0 && !canceled[1] {
                chunk.clone()
            } else {
                chunk.take()
            };
            if let Some(copy) = copy {
                let _ = branch.enqueue(copy);
            }
        }
    }

    fn close(&self) {
        trace!("tee source closed");
        self.finish();
        let canceled = self.state.lock().canceled;
        for (index, branch) in self.branches.iter().enumerate() {
            if !canceled[index] {
                let _ = branch.close();
            }
        }
        self.cancel_resolver.resolve(());
    }

    fn error(&self, error: StreamError) {
        debug!(%error, "tee source errored");
        self.finish();
        for branch in &self.branches {
            branch.error(error.clone());
        }
        self.cancel_resolver.resolve(());
    }

    fn finish(&self) {
        self.state.lock().finished = true;
    }

    /// Reads once, returning false when the source is done.
    async fn read_once(&self) -> bool {
        match self.reader.read().await {
            Ok(Some(chunk)) => {
                self.enqueue(chunk);
                true
            }
            Ok(None) => {
                self.close();
                false
            }
            Err(error) => {
                self.error(error);
                false
            }
        }
    }
}

fn composite_reason(reasons: &[Option<String>; 2]) -> Option<String> {
    let parts: Vec<&str> = reasons.iter().flatten().map(String::as_str).collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

/// Source behind one tee branch.
struct TeeBranch<T: MaybeSend + 'static> {
    index: usize,
    shared: SharedPtr<TeeShared<T>>,
    pulls: UnboundedSender<()>,
}

impl<T: Clone + MaybeSend + 'static> ReadableSource<T> for TeeBranch<T> {
    async fn pull(&mut self, _: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        let _ = self.pulls.unbounded_send(());
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        let composite = {
            let mut state = self.shared.state.lock();
            state.canceled[self.index] = true;
            state.reasons[self.index] = reason;
            (state.canceled == [true, true] && !state.finished)
                .then(|| composite_reason(&state.reasons))
        };
        if let Some(reason) = composite {
            debug!(?reason, "both tee branches canceled");
            match self.shared.reader.cancel(reason).await {
                Ok(()) => self.shared.cancel_resolver.resolve(()),
                Err(error) => self.shared.cancel_resolver.reject(error),
            }
        }
        self.shared.cancel_promise.clone().await
    }
}

async fn tee_task<T: Clone + MaybeSend + 'static>(
    shared: SharedPtr<TeeShared<T>>,
    mut pulls: UnboundedReceiver<()>,
) {
    let mut closed = Some(shared.reader.closed());
    loop {
        let pull = match closed.take() {
            Some(watch) => match future::select(pulls.next(), watch).await {
                Either::Left((pull, watch)) => {
                    closed = Some(watch);
                    pull
                }
                Either::Right((result, next)) => {
                    drop(next);
                    if let Err(error) = result {
                        shared.error(error);
                        break;
                    }
                    pulls.next().await
                }
            },
            None => pulls.next().await,
        };
        if pull.is_none() {
            break;
        }
        // Pulls that arrived during a read collapse into one more read.
        loop {
            if !shared.read_once().await {
                trace!("tee coordinator finished");
                return;
            }
            let mut again = false;
            while let Some(Some(())) = pulls.next().now_or_never() {
                again = true;
            }
            if !again {
                break;
            }
        }
    }
    trace!("tee coordinator finished");
}

impl<T: Clone + MaybeSend + 'static> ReadableStream<T> {
    /// Splits the stream into two branches that each see every chunk.
    ///
    /// The stream stays locked to the tee. Canceling one branch only stops delivery to it;
    /// its cancel settles when the other branch is canceled too, which cancels the source
    /// with both reasons joined, or when the source finishes.
    pub fn tee<F, R>(&self, spawn_fn: F) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)>
    where
        F: Fn(PlatformBoxFutureStatic<()>) -> R,
    {
        let (branches, drivers) = self.prepare_tee()?;
        for driver in drivers {
            spawn_fn(driver);
        }
        Ok(branches)
    }

    /// Branches plus the three driver futures (two branches and the coordinator).
    pub fn prepare_tee(
        &self,
    ) -> StreamResult<(
        (ReadableStream<T>, ReadableStream<T>),
        [PlatformBoxFutureStatic<()>; 3],
    )> {
        if self.locked() {
            return Err(StreamError::type_error("Cannot tee a locked ReadableStream"));
        }
        let reader = self.get_reader()?;

        let (first, first_handle, first_commands) =
            ReadableStream::create_parts(Box::new(CountQueuingStrategy::new(1.0)), 1.0);
        let (second, second_handle, second_commands) =
            ReadableStream::create_parts(Box::new(CountQueuingStrategy::new(1.0)), 1.0);

        let (cancel_promise, cancel_resolver) = Promise::pending();
        let shared = SharedPtr::new(TeeShared {
            reader,
            branches: [
                ReadableStreamDefaultController::new(WeakPtr::clone(&first_handle)),
                ReadableStreamDefaultController::new(WeakPtr::clone(&second_handle)),
            ],
            state: Mutex::new(TeeState {
                canceled: [false; 2],
                reasons: [None, None],
                finished: false,
            }),
            cancel_promise,
            cancel_resolver,
        });
        let (pulls_tx, pulls_rx) = unbounded();

        let branch = |index: usize,
                      handle: WeakReadableHandle<T>,
                      commands: UnboundedReceiver<SourceCommand>| {
            let source = TeeBranch {
                index,
                shared: SharedPtr::clone(&shared),
                pulls: pulls_tx.clone(),
            };
            let controller = ReadableStreamDefaultController::new(WeakPtr::clone(&handle));
            let driver: PlatformBoxFutureStatic<()> =
                Box::pin(readable_stream_task(source, controller, handle, commands));
            driver
        };
        let first_driver = branch(0, first_handle, first_commands);
        let second_driver = branch(1, second_handle, second_commands);
        drop(pulls_tx);
        let coordinator: PlatformBoxFutureStatic<()> = Box::pin(tee_task(shared, pulls_rx));

        Ok(((first, second), [first_driver, second_driver, coordinator]))
    }
}
