use super::{
    error::{StreamError, StreamResult},
    readable::{ReadableStream, ReadableStreamDefaultReader},
    transform::TransformStream,
    writable::{WritableStream, WritableStreamDefaultWriter},
};
use crate::platform::{MaybeSend, PlatformBoxFutureStatic};
use futures::future::{self, AbortRegistration, Abortable, Aborted, Either};
use std::{future::Future, pin::pin};
use tracing::debug;

/// Options for [`ReadableStream::pipe_to`].
#[derive(Debug, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    /// Stops the pipe; both ends are then shut down unless prevented.
    pub signal: Option<AbortRegistration>,
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    /// Pipes every chunk into `destination`, locking both streams until the pipe finishes.
    ///
    /// Fails with a TypeError if either stream is already locked.
    pub fn pipe_to(
        &self,
        destination: &WritableStream<T>,
        options: StreamPipeOptions,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let locks = self.lock_for_pipe(destination);
        async move {
            let (reader, writer) = locks?;
            run_pipe(reader, writer, options).await
        }
    }

    /// Pipes into the writable side of `transform` and returns its readable side.
    ///
    /// The pipe future goes to `spawn_fn`; its failure is only logged, since it surfaces on
    /// the returned stream anyway.
    pub fn pipe_through<O, F, R>(
        &self,
        transform: TransformStream<T, O>,
        options: StreamPipeOptions,
        spawn_fn: F,
    ) -> StreamResult<ReadableStream<O>>
    where
        O: MaybeSend + 'static,
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (readable, writable) = transform.split();
        let (reader, writer) = self.lock_for_pipe(&writable)?;
        spawn_fn(Box::pin(async move {
            if let Err(error) = run_pipe(reader, writer, options).await {
                debug!(%error, "pipe through finished with error");
            }
        }));
        Ok(readable)
    }

    fn lock_for_pipe(
        &self,
        destination: &WritableStream<T>,
    ) -> StreamResult<(ReadableStreamDefaultReader<T>, WritableStreamDefaultWriter<T>)> {
        if self.locked() {
            return Err(StreamError::type_error("Cannot pipe a locked ReadableStream"));
        }
        if destination.locked() {
            return Err(StreamError::type_error("Cannot pipe to a locked WritableStream"));
        }
        let reader = self.get_reader()?;
        let writer = destination.get_writer()?;
        Ok((reader, writer))
    }
}

async fn run_pipe<T: MaybeSend + 'static>(
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    mut options: StreamPipeOptions,
) -> StreamResult<()> {
    let Some(registration) = options.signal.take() else {
        return pipe_loop(&reader, &writer, &options).await;
    };
    match Abortable::new(pipe_loop(&reader, &writer, &options), registration).await {
        Ok(result) => result,
        Err(Aborted) => {
            debug!("pipe aborted");
            let reason = Some("Pipe operation aborted".to_string());
            let error = StreamError::Aborted(reason.clone());
            if !options.prevent_abort {
                let _ = writer.abort(reason.clone()).await;
            }
            if !options.prevent_cancel {
                let _ = reader.cancel(reason).await;
            }
            Err(error)
        }
    }
}

async fn pipe_loop<T: MaybeSend + 'static>(
    reader: &ReadableStreamDefaultReader<T>,
    writer: &WritableStreamDefaultWriter<T>,
    options: &StreamPipeOptions,
) -> StreamResult<()> {
    let mut last_write = None;
    loop {
        match writer.closed().peek() {
            Some(Ok(())) => {
                let error = StreamError::type_error("Destination stream closed");
                return destination_failed(reader, options, error).await;
            }
            Some(Err(error)) => return destination_failed(reader, options, error).await,
            None => {}
        }

        // The source may finish while the destination applies backpressure.
        match future::select(writer.ready(), reader.closed()).await {
            Either::Left((Ok(()), _)) => {}
            Either::Left((Err(error), _)) => {
                return destination_failed(reader, options, error).await;
            }
            Either::Right((Ok(()), _)) => return source_closed(writer, options, last_write).await,
            Either::Right((Err(error), _)) => return source_errored(writer, options, error).await,
        }

        let read = pin!(reader.read());
        let chunk = match future::select(read, writer.closed()).await {
            Either::Left((read, _)) => read,
            // Loop back so the closed check reports the destination.
            Either::Right(_) => continue,
        };

        match chunk {
            Ok(Some(chunk)) => last_write = Some(writer.write(chunk)),
            Ok(None) => return source_closed(writer, options, last_write).await,
            Err(error) => return source_errored(writer, options, error).await,
        }
    }
}

async fn source_closed<T: MaybeSend + 'static>(
    writer: &WritableStreamDefaultWriter<T>,
    options: &StreamPipeOptions,
    last_write: Option<impl Future<Output = StreamResult<()>>>,
) -> StreamResult<()> {
    if !options.prevent_close {
        return writer.close().await;
    }
    if let Some(write) = last_write {
        write.await?;
    }
    Ok(())
}

async fn source_errored<T: MaybeSend + 'static>(
    writer: &WritableStreamDefaultWriter<T>,
    options: &StreamPipeOptions,
    error: StreamError,
) -> StreamResult<()> {
    debug!(%error, "pipe source errored");
    if !options.prevent_abort {
        writer.abort(error.reason()).await?;
    }
    Err(error)
}

async fn destination_failed<T: MaybeSend + 'static>(
    reader: &ReadableStreamDefaultReader<T>,
    options: &StreamPipeOptions,
    error: StreamError,
) -> StreamResult<()> {
    debug!(%error, "pipe destination failed");
    if !options.prevent_cancel {
        reader.cancel(error.reason()).await?;
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        ReadableSource, ReadableStreamDefaultController, StreamState, TransformStreamDefaultController,
        Transformer, WritableSink, WritableState, WritableStreamDefaultController,
        test_support::{local_test, spawn_driver},
    };
    use futures::{channel::oneshot, future::AbortHandle};
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc, time::Duration};
    use tokio::time::timeout;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records writes, fails on `fail_on`.
    struct Collect {
        log: Log,
        fail_on: Option<u32>,
    }

    impl WritableSink<u32> for Collect {
        async fn write(&mut self, chunk: u32, _: &mut WritableStreamDefaultController) -> StreamResult<()> {
            if self.fail_on == Some(chunk) {
                return Err(StreamError::type_error("sink refused"));
            }
            self.log.lock().push(format!("write:{chunk}"));
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.log.lock().push("close".into());
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.log.lock().push(format!("abort:{}", reason.unwrap_or_default()));
            Ok(())
        }
    }

    fn collect(fail_on: Option<u32>) -> (WritableStream<u32>, Log) {
        let log = Log::default();
        let sink = Collect {
            log: Arc::clone(&log),
            fail_on,
        };
        (WritableStream::builder(sink).spawn(spawn_driver).unwrap(), log)
    }

    /// Counts upward forever; errors after `fail_after` chunks when set.
    struct Counter {
        next: u32,
        fail_after: Option<u32>,
        log: Log,
    }

    impl ReadableSource<u32> for Counter {
        async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            if self.fail_after == Some(self.next) {
                return Err(StreamError::type_error("source broke"));
            }
            self.next += 1;
            controller.enqueue(self.next)
        }

        async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.log.lock().push(format!("cancel:{}", reason.unwrap_or_default()));
            Ok(())
        }
    }

    fn counter(fail_after: Option<u32>) -> (ReadableStream<u32>, Log) {
        let log = Log::default();
        let source = Counter {
            next: 0,
            fail_after,
            log: Arc::clone(&log),
        };
        (ReadableStream::builder(source).spawn(spawn_driver).unwrap(), log)
    }

    #[tokio::test]
    async fn pipes_every_chunk_then_closes() {
        local_test(async {
            let source = ReadableStream::from_vec(vec![1, 2, 3]).spawn(spawn_driver).unwrap();
            let (dest, log) = collect(None);

            source.pipe_to(&dest, StreamPipeOptions::default()).await.unwrap();

            assert_eq!(*log.lock(), vec!["write:1", "write:2", "write:3", "close"]);
            assert_eq!(dest.state(), WritableState::Closed);
            assert!(!source.locked());
            assert!(!dest.locked());
        })
        .await;
    }

    #[tokio::test]
    async fn prevent_close_leaves_destination_writable() {
        local_test(async {
            let source = ReadableStream::from_vec(vec![5]).spawn(spawn_driver).unwrap();
            let (dest, log) = collect(None);
            let options = StreamPipeOptions {
                prevent_close: true,
                ..Default::default()
            };

            source.pipe_to(&dest, options).await.unwrap();

            assert_eq!(*log.lock(), vec!["write:5"]);
            assert_eq!(dest.state(), WritableState::Writable);
            assert!(!dest.locked());
        })
        .await;
    }

    #[tokio::test]
    async fn source_error_aborts_destination() {
        local_test(async {
            let (source, _) = counter(Some(2));
            let (dest, log) = collect(None);

            let error = source.pipe_to(&dest, StreamPipeOptions::default()).await.unwrap_err();

            assert!(error.is_type_error());
            assert_eq!(dest.state(), WritableState::Errored);
            assert_eq!(log.lock().last().map(String::as_str), Some("abort:TypeError: source broke"));
        })
        .await;
    }

    #[tokio::test]
    async fn prevent_abort_keeps_destination_open() {
        local_test(async {
            let (source, _) = counter(Some(0));
            let (dest, log) = collect(None);
            let options = StreamPipeOptions {
                prevent_abort: true,
                ..Default::default()
            };

            assert!(source.pipe_to(&dest, options).await.is_err());
            assert_eq!(dest.state(), WritableState::Writable);
            assert!(log.lock().is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn destination_error_cancels_source() {
        local_test(async {
            let (source, canceled) = counter(None);
            let (dest, _) = collect(Some(2));

            let error = source.pipe_to(&dest, StreamPipeOptions::default()).await.unwrap_err();

            assert!(error.is_type_error());
            assert_eq!(source.state(), StreamState::Closed);
            assert_eq!(*canceled.lock(), vec!["cancel:TypeError: sink refused"]);
        })
        .await;
    }

    #[tokio::test]
    async fn prevent_cancel_leaves_source_readable() {
        local_test(async {
            let (source, canceled) = counter(None);
            let (dest, _) = collect(Some(1));
            let options = StreamPipeOptions {
                prevent_cancel: true,
                ..Default::default()
            };

            assert!(source.pipe_to(&dest, options).await.is_err());
            assert_eq!(source.state(), StreamState::Readable);
            assert!(canceled.lock().is_empty());
            assert!(!source.locked());
        })
        .await;
    }

    #[tokio::test]
    async fn locked_streams_cannot_be_piped() {
        local_test(async {
            let source = ReadableStream::from_vec(vec![1u32]).spawn(spawn_driver).unwrap();
            let (dest, _) = collect(None);
            let _writer = dest.get_writer().unwrap();

            let error = source.pipe_to(&dest, StreamPipeOptions::default()).await.unwrap_err();

            assert!(error.is_type_error());
            assert!(!source.locked());
        })
        .await;
    }

    #[tokio::test]
    async fn abort_signal_shuts_down_both_ends() {
        local_test(async {
            let (source, canceled) = counter(None);
            let (dest, log) = collect(None);
            let (handle, registration) = AbortHandle::new_pair();
            handle.abort();
            let options = StreamPipeOptions {
                signal: Some(registration),
                ..Default::default()
            };

            let error = source.pipe_to(&dest, options).await.unwrap_err();

            assert!(matches!(error, StreamError::Aborted(_)));
            assert_eq!(dest.state(), WritableState::Errored);
            assert_eq!(*log.lock(), vec!["abort:Pipe operation aborted"]);
            assert_eq!(*canceled.lock(), vec!["cancel:Pipe operation aborted"]);
        })
        .await;
    }

    type Gates = Arc<Mutex<VecDeque<oneshot::Sender<StreamResult<()>>>>>;

    /// Each write waits until the test releases its gate.
    struct Gated {
        log: Log,
        gates: Gates,
    }

    impl WritableSink<u32> for Gated {
        async fn write(&mut self, chunk: u32, _: &mut WritableStreamDefaultController) -> StreamResult<()> {
            self.log.lock().push(format!("write:{chunk}"));
            let (tx, rx) = oneshot::channel();
            self.gates.lock().push_back(tx);
            rx.await.unwrap_or(Ok(()))
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.log.lock().push(format!("abort:{}", reason.unwrap_or_default()));
            Ok(())
        }
    }

    type Slot = Arc<Mutex<Option<ReadableStreamDefaultController<u32>>>>;

    struct Pushed {
        slot: Slot,
    }

    impl ReadableSource<u32> for Pushed {
        async fn start(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            *self.slot.lock() = Some(controller.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn source_error_under_backpressure_aborts_destination() {
        local_test(async {
            let slot = Slot::default();
            let source = ReadableStream::builder(Pushed { slot: Arc::clone(&slot) })
                .spawn(spawn_driver)
                .unwrap();
            let log = Log::default();
            let gates = Gates::default();
            let dest = WritableStream::builder(Gated {
                log: Arc::clone(&log),
                gates: Arc::clone(&gates),
            })
            .spawn(spawn_driver)
            .unwrap();
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            let controller = slot.lock().clone().unwrap();
            controller.enqueue(1).unwrap();
            controller.enqueue(2).unwrap();

            let mut pipe = Box::pin(source.pipe_to(&dest, StreamPipeOptions::default()));
            assert!(timeout(Duration::from_millis(20), &mut pipe).await.is_err());
            assert_eq!(*log.lock(), vec!["write:1"]);

            controller.error(StreamError::type_error("source broke"));
            assert!(timeout(Duration::from_millis(20), &mut pipe).await.is_err());
            assert_eq!(dest.state(), WritableState::Erroring);

            let gate = gates.lock().pop_front().unwrap();
            gate.send(Ok(())).unwrap();
            let error = timeout(Duration::from_millis(200), &mut pipe).await.unwrap().unwrap_err();

            assert!(error.is_type_error());
            assert_eq!(dest.state(), WritableState::Errored);
            assert_eq!(*log.lock(), vec!["write:1", "abort:TypeError: source broke"]);
            assert!(!source.locked());
            assert!(!dest.locked());
        })
        .await;
    }

    struct Double;

    impl Transformer<u32, u32> for Double {
        async fn transform(&mut self, chunk: u32, controller: &mut TransformStreamDefaultController<u32>) -> StreamResult<()> {
            controller.enqueue(chunk * 2)
        }
    }

    #[tokio::test]
    async fn pipe_through_returns_transformed_readable() {
        local_test(async {
            let source = ReadableStream::from_vec(vec![1, 2, 3]).spawn(spawn_driver).unwrap();
            let transform = TransformStream::builder(Double).spawn(spawn_driver).unwrap();

            let doubled = source
                .pipe_through(transform, StreamPipeOptions::default(), spawn_driver)
                .unwrap();
            assert!(source.locked());

            let reader = doubled.get_reader().unwrap();
            let mut seen = Vec::new();
            while let Some(chunk) = reader.read().await.unwrap() {
                seen.push(chunk);
            }
            assert_eq!(seen, vec![2, 4, 6]);
        })
        .await;
    }
}
