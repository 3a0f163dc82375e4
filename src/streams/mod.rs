pub mod byte_stream;
pub mod error;
pub mod pipe;
pub mod promise;
pub mod queue;
pub mod readable;
pub mod tee;
pub mod transform;
pub mod writable;

pub use byte_stream::*;
pub use error::*;
pub use pipe::*;
pub use promise::{Promise, Resolver};
pub use queue::{QueuingStrategyInit, extract_high_water_mark};
pub use readable::*;
pub use transform::*;
pub use writable::*;

/// Assigns a cost to every chunk and bounds the total cost a stream queues before it
/// signals backpressure.
pub trait QueuingStrategy<T> {
    /// Size of a chunk.
    ///
    /// `Ok(None)` marks the chunk as uncountable; enqueueing it fails with a RangeError.
    /// `Err(e)` errors the stream with `e`.
    fn size(&self, chunk: &T) -> StreamResult<Option<f64>>;

    fn high_water_mark(&self) -> f64;
}

/// Every chunk costs 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<Option<f64>> {
        Ok(Some(1.0))
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl TryFrom<QueuingStrategyInit> for CountQueuingStrategy {
    type Error = StreamError;

    fn try_from(init: QueuingStrategyInit) -> StreamResult<Self> {
        init.required_high_water_mark().map(Self::new)
    }
}

/// Chunks that may expose a byte length.
pub trait ByteLength {
    fn byte_length(&self) -> Option<usize>;
}

impl ByteLength for Vec<u8> {
    fn byte_length(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl ByteLength for [u8] {
    fn byte_length(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<const N: usize> ByteLength for [u8; N] {
    fn byte_length(&self) -> Option<usize> {
        Some(N)
    }
}

impl ByteLength for Box<[u8]> {
    fn byte_length(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl ByteLength for String {
    fn byte_length(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl ByteLength for str {
    fn byte_length(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<B: ByteLength + ?Sized> ByteLength for &B {
    fn byte_length(&self) -> Option<usize> {
        (**self).byte_length()
    }
}

impl<B: ByteLength> ByteLength for Option<B> {
    fn byte_length(&self) -> Option<usize> {
        self.as_ref().and_then(ByteLength::byte_length)
    }
}

/// Each chunk costs its byte length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<T: ByteLength> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &T) -> StreamResult<Option<f64>> {
        Ok(chunk.byte_length().map(|len| len as f64))
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl TryFrom<QueuingStrategyInit> for ByteLengthQueuingStrategy {
    type Error = StreamError;

    fn try_from(init: QueuingStrategyInit) -> StreamResult<Self> {
        init.required_high_water_mark().map(Self::new)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::future::Future;
    use tokio::task::LocalSet;

    /// Drivers are spawned with `spawn_local`, so tests run inside a `LocalSet`.
    pub async fn local_test<F: Future>(f: F) -> F::Output {
        LocalSet::new().run_until(f).await
    }

    pub fn spawn_driver<F>(fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        tokio::task::spawn_local(fut);
    }
}
