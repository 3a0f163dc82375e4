//! End-to-end scenarios run through the public API only.

use futures::channel::oneshot;
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::LocalSet, time::timeout};
use whatwg_streams_core::{
    ByteLengthQueuingStrategy, CountQueuingStrategy, MaybeSend, ReadableSource, ReadableStream,
    ReadableStreamDefaultController, StreamError, StreamResult, TransformStream,
    TransformStreamDefaultController, Transformer, WritableSink, WritableStream,
    WritableStreamDefaultController,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn run_local<F: Future>(f: F) -> F::Output {
    init_tracing();
    LocalSet::new().run_until(f).await
}

fn spawn<F: Future<Output = ()> + 'static>(fut: F) {
    tokio::task::spawn_local(fut);
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

type ControllerSlot<T> = Arc<Mutex<Option<ReadableStreamDefaultController<T>>>>;

/// Hands its controller to the test.
struct Captured<T>(ControllerSlot<T>);

impl<T: MaybeSend + 'static> ReadableSource<T> for Captured<T> {
    async fn start(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        *self.0.lock().unwrap() = Some(controller.clone());
        Ok(())
    }
}

async fn captured<T: MaybeSend + 'static>(
    builder: impl FnOnce(Captured<T>) -> ReadableStream<T>,
) -> (ReadableStream<T>, ReadableStreamDefaultController<T>) {
    let slot = ControllerSlot::default();
    let stream = builder(Captured(Arc::clone(&slot)));
    settle().await;
    let controller = slot.lock().unwrap().clone().unwrap();
    (stream, controller)
}

#[tokio::test]
async fn count_strategy_desired_size_counts_down() {
    run_local(async {
        let (_stream, controller) = captured::<&'static str>(|source| {
            ReadableStream::builder(source)
                .strategy(CountQueuingStrategy::new(4.0))
                .spawn(spawn)
                .unwrap()
        })
        .await;

        let mut sizes = vec![controller.desired_size()];
        for chunk in ["a", "b", "c"] {
            controller.enqueue(chunk).unwrap();
            sizes.push(controller.desired_size());
        }

        assert_eq!(sizes, vec![Some(4.0), Some(3.0), Some(2.0), Some(1.0)]);
    })
    .await;
}

#[tokio::test]
async fn byte_length_strategy_desired_size_tracks_bytes() {
    run_local(async {
        let (stream, controller) = captured::<Vec<u8>>(|source| {
            ReadableStream::builder(source)
                .strategy(ByteLengthQueuingStrategy::new(200.0))
                .spawn(spawn)
                .unwrap()
        })
        .await;

        let mut sizes = vec![controller.desired_size()];
        controller.enqueue(vec![0u8; 50]).unwrap();
        sizes.push(controller.desired_size());
        controller.enqueue(vec![0u8; 100]).unwrap();
        sizes.push(controller.desired_size());
        assert_eq!(sizes, vec![Some(200.0), Some(150.0), Some(50.0)]);

        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap().map(|chunk| chunk.len()), Some(50));
        assert_eq!(controller.desired_size(), Some(100.0));
    })
    .await;
}

#[tokio::test]
async fn enqueue_then_close_reads_chunk_then_done() {
    struct OneShot;

    impl ReadableSource<&'static str> for OneShot {
        async fn start(
            &mut self,
            controller: &mut ReadableStreamDefaultController<&'static str>,
        ) -> StreamResult<()> {
            controller.enqueue("x")?;
            controller.close()
        }
    }

    run_local(async {
        let stream = ReadableStream::builder(OneShot).spawn(spawn).unwrap();
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some("x"));
        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn writes_are_never_pipelined() {
    struct Stalled {
        started: Arc<Mutex<Vec<u32>>>,
        gate: Option<oneshot::Receiver<()>>,
    }

    impl WritableSink<u32> for Stalled {
        async fn write(&mut self, chunk: u32, _: &mut WritableStreamDefaultController) -> StreamResult<()> {
            self.started.lock().unwrap().push(chunk);
            if let Some(gate) = self.gate.take() {
                let _ = gate.await;
            }
            Ok(())
        }
    }

    run_local(async {
        let started = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = oneshot::channel();
        let stream = WritableStream::builder(Stalled {
            started: Arc::clone(&started),
            gate: Some(gate),
        })
        .spawn(spawn)
        .unwrap();
        let writer = stream.get_writer().unwrap();

        let first = writer.write(1);
        let mut second = Box::pin(writer.write(2));
        settle().await;

        assert_eq!(*started.lock().unwrap(), vec![1]);
        assert!(timeout(Duration::from_millis(20), &mut second).await.is_err());

        release.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*started.lock().unwrap(), vec![1, 2]);
    })
    .await;
}

struct Explode;

impl Transformer<u32, u32> for Explode {
    async fn transform(&mut self, _: u32, _: &mut TransformStreamDefaultController<u32>) -> StreamResult<()> {
        Err(StreamError::from("boom"))
    }
}

#[tokio::test]
async fn throwing_transform_rejects_both_sides() {
    run_local(async {
        let stream = TransformStream::builder(Explode).spawn(spawn).unwrap();
        let reader = stream.readable().get_reader().unwrap();
        let writer = stream.writable().get_writer().unwrap();

        let read = reader.read();
        let write = writer.write(1);

        assert_eq!(write.await.unwrap_err().to_string(), "boom");
        assert_eq!(read.await.unwrap_err().to_string(), "boom");
        assert_eq!(writer.closed().await.unwrap_err().to_string(), "boom");
        assert_eq!(reader.closed().await.unwrap_err().to_string(), "boom");
    })
    .await;
}

struct Triple;

impl Transformer<u32, u32> for Triple {
    async fn transform(&mut self, chunk: u32, controller: &mut TransformStreamDefaultController<u32>) -> StreamResult<()> {
        for _ in 0..3 {
            controller.enqueue(chunk)?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn full_readable_side_holds_back_the_writer() {
    run_local(async {
        let stream = TransformStream::builder(Triple)
            .readable_strategy(CountQueuingStrategy::new(2.0))
            .spawn(spawn)
            .unwrap();
        let reader = stream.readable().get_reader().unwrap();
        let writer = stream.writable().get_writer().unwrap();
        settle().await;

        writer.write(1).await.unwrap();
        let second = writer.write(2);
        settle().await;
        assert!(writer.ready().is_pending());

        for _ in 0..3 {
            assert_eq!(reader.read().await.unwrap(), Some(1));
        }
        timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), writer.ready())
            .await
            .unwrap()
            .unwrap();
    })
    .await;
}
