//! Platform-specific type aliases and trait bounds
//!
//! - `send` feature (default): `Arc` and `Send` futures
//! - `local` feature: `Rc` and no `Send` requirements

#[cfg(all(feature = "send", feature = "local"))]
compile_error!("features `send` and `local` are mutually exclusive");

#[cfg(not(any(feature = "send", feature = "local")))]
compile_error!("enable exactly one of the `send` or `local` features");

// ============================================================================
// MULTI-THREADED (send feature - default)
// ============================================================================
#[cfg(feature = "send")]
pub use std::sync::Arc as SharedPtr;
#[cfg(feature = "send")]
pub use std::sync::Weak as WeakPtr;

#[cfg(feature = "send")]
pub trait MaybeSend: Send {}
#[cfg(feature = "send")]
impl<T: Send> MaybeSend for T {}

#[cfg(feature = "send")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "send")]
impl<T: Sync> MaybeSync for T {}

/// Driver futures handed to the caller's spawner.
#[cfg(feature = "send")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

#[cfg(feature = "send")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + Send + 'static>;

#[cfg(feature = "send")]
pub type SharedError = std::sync::Arc<dyn std::error::Error + Send + Sync>;

// ============================================================================
// SINGLE-THREADED (local feature)
// ============================================================================
#[cfg(feature = "local")]
pub use std::rc::Rc as SharedPtr;
#[cfg(feature = "local")]
pub use std::rc::Weak as WeakPtr;

#[cfg(feature = "local")]
pub trait MaybeSend {}
#[cfg(feature = "local")]
impl<T> MaybeSend for T {}

#[cfg(feature = "local")]
pub trait MaybeSync {}
#[cfg(feature = "local")]
impl<T> MaybeSync for T {}

#[cfg(feature = "local")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + 'static>>;

#[cfg(feature = "local")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;

#[cfg(feature = "local")]
pub type SharedError = std::rc::Rc<dyn std::error::Error>;
