//! Readable, writable and transform streams with backpressure, following the WHATWG
//! Streams model.
//!
//! Streams never spawn on their own. Builders either return the driver future from
//! `prepare()` or hand it to a caller-supplied spawner via `spawn(..)`:
//!
//! ```ignore
//! let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn)?;
//! let reader = stream.get_reader()?;
//! while let Some(chunk) = reader.read().await? {
//!     println!("{chunk}");
//! }
//! ```
//!
//! The `send` feature (default) makes every stream `Send + Sync`; the `local` feature
//! drops those bounds for single-threaded executors.

mod platform;
pub mod streams;

pub use platform::{MaybeSend, MaybeSync, PlatformBoxFutureStatic};
pub use streams::*;
