/// Compile-time tests to verify Send/Sync bounds are correct for each feature
///
/// Run with:
///   cargo test --features send  (default)
///   cargo test --no-default-features --features local
use whatwg_streams_core::{
    ReadableStream, ReadableStreamDefaultReader, StreamError, TransformStream, WritableSink,
    WritableStream, WritableStreamDefaultController, WritableStreamDefaultWriter,
};

#[cfg(feature = "send")]
fn assert_send<T: Send>() {}

#[cfg(feature = "send")]
fn assert_sync<T: Sync>() {}

#[cfg(feature = "send")]
#[test]
fn send_feature_handles_are_send_sync() {
    assert_send::<ReadableStream<i32>>();
    assert_sync::<ReadableStream<i32>>();
    assert_send::<ReadableStreamDefaultReader<i32>>();
    assert_sync::<ReadableStreamDefaultReader<i32>>();
    assert_send::<WritableStream<String>>();
    assert_sync::<WritableStream<String>>();
    assert_send::<WritableStreamDefaultWriter<String>>();
    assert_sync::<WritableStreamDefaultWriter<String>>();
    assert_send::<TransformStream<String, usize>>();
    assert_send::<StreamError>();
    assert_sync::<StreamError>();
}

#[cfg(feature = "send")]
#[test]
fn send_feature_drivers_are_send() {
    fn driver_is_send<F: std::future::Future + Send>(_: &F) {}

    struct DummySink;

    impl WritableSink<String> for DummySink {
        async fn write(
            &mut self,
            _chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> Result<(), StreamError> {
            Ok(())
        }
    }

    let (_stream, driver) = WritableStream::builder(DummySink).prepare().unwrap();
    driver_is_send(&driver);

    let (readable, driver) = ReadableStream::from_vec(vec![1, 2]).prepare().unwrap();
    driver_is_send(&driver);
    driver_is_send(&readable.cancel(None));
}

#[cfg(feature = "local")]
#[test]
fn local_feature_accepts_non_send_chunks() {
    use std::{cell::RefCell, rc::Rc};

    let (stream, _driver) = ReadableStream::from_vec(vec![Rc::new(RefCell::new(42))])
        .prepare()
        .unwrap();
    assert!(!stream.locked());
}

#[test]
fn public_types_are_reachable_from_the_root() {
    let _: Option<ReadableStream<i32>> = None;
    let _: Option<WritableStream<i32>> = None;
    let _: Option<TransformStream<i32, i32>> = None;
}
