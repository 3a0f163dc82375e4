/// Drivers run on real executors: `tokio::spawn` under `send` (requires Send),
/// `spawn_local` under `local`.

#[cfg(feature = "send")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_feature_with_tokio_spawn() {
    use whatwg_streams_core::{ReadableStream, StreamPipeOptions, TransformStream, WritableStream};

    let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn).unwrap();
    let identity = TransformStream::<i32, i32>::identity().spawn(tokio::spawn).unwrap();
    let readable = stream
        .pipe_through(identity, StreamPipeOptions::default(), tokio::spawn)
        .unwrap();

    let reader = readable.get_reader().unwrap();
    let mut result = Vec::new();
    while let Some(val) = reader.read().await.unwrap() {
        result.push(val);
    }
    assert_eq!(result, vec![1, 2, 3]);

    // Writers can be moved to another task.
    let (collected, sink) = collector();
    let writable = WritableStream::builder(sink).spawn(tokio::spawn).unwrap();
    let writer = writable.get_writer().unwrap();
    tokio::spawn(async move {
        writer.write(7).await.unwrap();
        writer.close().await.unwrap();
    })
    .await
    .unwrap();
    assert_eq!(*collected.lock().unwrap(), vec![7]);
}

#[cfg(feature = "send")]
fn collector() -> (
    std::sync::Arc<std::sync::Mutex<Vec<i32>>>,
    impl whatwg_streams_core::WritableSink<i32>,
) {
    use std::sync::{Arc, Mutex};
    use whatwg_streams_core::{StreamResult, WritableSink, WritableStreamDefaultController};

    struct Collect(Arc<Mutex<Vec<i32>>>);

    impl WritableSink<i32> for Collect {
        async fn write(&mut self, chunk: i32, _: &mut WritableStreamDefaultController) -> StreamResult<()> {
            self.0.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    let collected = Arc::new(Mutex::new(Vec::new()));
    (Arc::clone(&collected), Collect(collected))
}

#[cfg(feature = "local")]
#[tokio::test]
async fn local_feature_with_spawn_local() {
    use std::rc::Rc;
    use tokio::task::LocalSet;
    use whatwg_streams_core::ReadableStream;

    let local = LocalSet::new();

    local
        .run_until(async {
            // spawn_local does NOT require Send
            let stream = ReadableStream::from_vec(vec![Rc::new(1), Rc::new(2), Rc::new(3)])
                .spawn(tokio::task::spawn_local)
                .unwrap();

            let reader = stream.get_reader().unwrap();

            let mut result = Vec::new();
            while let Some(val) = reader.read().await.unwrap() {
                result.push(*val);
            }

            assert_eq!(result, vec![1, 2, 3]);
        })
        .await;
}
