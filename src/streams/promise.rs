//! Exactly-once settled values shared between a stream and the handles observing it.
//!
//! `closed` and `ready` can be awaited any number of times by any number of tasks, and a
//! stream sometimes needs to swap one for a fresh pending instance (writer `ready` on
//! backpressure). [`Promise::pending`] returns the `(promise, resolver)` pair; the resolver
//! settles once and later settlements are ignored.

use super::error::{StreamError, StreamResult};
use crate::platform::SharedPtr;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

enum Settlement<T> {
    Pending(Waiters),
    Settled(StreamResult<T>),
}

/// Wakers keyed by the promise handle that registered them.
#[derive(Default)]
struct Waiters {
    next_key: usize,
    wakers: Vec<(usize, Waker)>,
}

impl Waiters {
    fn register(&mut self, key: &mut Option<usize>, waker: &Waker) {
        if let Some(key) = *key {
            if let Some((_, slot)) = self.wakers.iter_mut().find(|(k, _)| *k == key) {
                if !slot.will_wake(waker) {
                    *slot = waker.clone();
                }
                return;
            }
        }
        let fresh = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        self.wakers.push((fresh, waker.clone()));
        *key = Some(fresh);
    }

    fn remove(&mut self, key: usize) {
        self.wakers.retain(|(k, _)| *k != key);
    }
}

/// A cloneable future that resolves to the settled value of its [`Resolver`].
///
/// Each handle keeps at most one waker registered and drops it with the handle.
pub struct Promise<T> {
    slot: SharedPtr<Mutex<Settlement<T>>>,
    key: Option<usize>,
}

/// Settling half of a [`Promise`].
pub struct Resolver<T> {
    slot: SharedPtr<Mutex<Settlement<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: SharedPtr::clone(&self.slot),
            key: None,
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            if let Settlement::Pending(waiters) = &mut *self.slot.lock() {
                waiters.remove(key);
            }
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: SharedPtr::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.slot.lock() {
            Settlement::Pending(_) => "pending",
            Settlement::Settled(Ok(_)) => "fulfilled",
            Settlement::Settled(Err(_)) => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T> Promise<T> {
    pub fn pending() -> (Promise<T>, Resolver<T>) {
        let slot = SharedPtr::new(Mutex::new(Settlement::Pending(Waiters::default())));
        (
            Promise {
                slot: SharedPtr::clone(&slot),
                key: None,
            },
            Resolver { slot },
        )
    }

    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: StreamError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: StreamResult<T>) -> Self {
        Self {
            slot: SharedPtr::new(Mutex::new(Settlement::Settled(result))),
            key: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.slot.lock(), Settlement::Pending(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(&*self.slot.lock(), Settlement::Settled(Err(_)))
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        match &*self.slot.lock() {
            Settlement::Pending(waiters) => waiters.wakers.len(),
            Settlement::Settled(_) => 0,
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Settled value, if any, without waiting.
    pub fn peek(&self) -> Option<StreamResult<T>> {
        match &*self.slot.lock() {
            Settlement::Pending(_) => None,
            Settlement::Settled(result) => Some(result.clone()),
        }
    }
}

impl<T> Resolver<T> {
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: StreamError) {
        self.settle(Err(error));
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.slot.lock(), Settlement::Pending(_))
    }

    fn settle(&self, result: StreamResult<T>) {
        let waiters = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Settlement::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *slot = Settlement::Settled(result);
                    waiters
                }
                Settlement::Settled(_) => return,
            }
        };
        for (_, waker) in waiters.wakers {
            waker.wake();
        }
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut slot = this.slot.lock();
        match &mut *slot {
            Settlement::Settled(result) => Poll::Ready(result.clone()),
            Settlement::Pending(waiters) => {
                waiters.register(&mut this.key, cx.waker());
                Poll::Pending
            }
        }
    }
}

/// A promise slot that can be replaced while handles keep reading the current one.
pub(crate) struct PromiseSlot<T> {
    promise: Promise<T>,
    resolver: Option<Resolver<T>>,
}

impl<T> PromiseSlot<T> {
    pub(crate) fn pending() -> Self {
        let (promise, resolver) = Promise::pending();
        Self {
            promise,
            resolver: Some(resolver),
        }
    }

    pub(crate) fn resolved(value: T) -> Self {
        Self {
            promise: Promise::resolved(value),
            resolver: None,
        }
    }

    pub(crate) fn rejected(error: StreamError) -> Self {
        Self {
            promise: Promise::rejected(error),
            resolver: None,
        }
    }

    pub(crate) fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.promise.is_pending()
    }

    pub(crate) fn resolve(&mut self, value: T) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(value);
        }
    }

    pub(crate) fn reject(&mut self, error: StreamError) {
        if let Some(resolver) = self.resolver.take() {
            resolver.reject(error);
        }
    }

    /// Reject the current promise, or replace a settled one with a rejected promise.
    pub(crate) fn ensure_rejected(&mut self, error: StreamError) {
        if self.is_pending() {
            self.reject(error);
        } else {
            *self = Self::rejected(error);
        }
    }
}

/// Result of an operation that either settled on the spot or waits on a request.
pub(crate) enum Outcome<T> {
    Ready(StreamResult<T>),
    Waiting(oneshot::Receiver<StreamResult<T>>),
}

impl<T> Outcome<T> {
    pub(crate) fn channel() -> (oneshot::Sender<StreamResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Outcome::Waiting(rx))
    }

    pub(crate) async fn wait(self) -> StreamResult<T> {
        self.await
    }
}

// The settled value is only ever moved out, never pinned.
impl<T> Unpin for Outcome<T> {}

impl<T> Future for Outcome<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            // Polling past completion yields TaskDropped.
            Outcome::Ready(result) => {
                Poll::Ready(std::mem::replace(result, Err(StreamError::TaskDropped)))
            }
            Outcome::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|settled| settled.unwrap_or_else(|_| Err(StreamError::TaskDropped))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn settles_exactly_once() {
        let (promise, resolver) = Promise::<u32>::pending();
        assert!(promise.is_pending());

        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject("late".into());

        assert_eq!(promise.peek().unwrap().unwrap(), 1);
        assert_eq!(promise.clone().now_or_never().unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn wakes_every_waiter() {
        let (promise, resolver) = Promise::<()>::pending();
        let waiters = futures::future::join(promise.clone(), promise.clone());
        let settle = async {
            tokio::task::yield_now().await;
            resolver.reject(StreamError::type_error("nope"));
        };

        let ((a, b), ()) = futures::future::join(waiters, settle).await;

        assert!(a.unwrap_err().is_type_error());
        assert!(b.unwrap_err().is_type_error());
    }

    #[test]
    fn dropped_handles_release_their_wakers() {
        let (promise, resolver) = Promise::<()>::pending();
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        for _ in 0..100 {
            let mut waiter = promise.clone();
            assert!(Pin::new(&mut waiter).poll(&mut cx).is_pending());
        }
        assert_eq!(promise.waiter_count(), 0);

        let mut held = promise.clone();
        for _ in 0..3 {
            assert!(Pin::new(&mut held).poll(&mut cx).is_pending());
        }
        assert_eq!(promise.waiter_count(), 1);

        resolver.resolve(());
        assert!(Pin::new(&mut held).poll(&mut cx).is_ready());
    }

    #[test]
    fn ensure_rejected_replaces_settled_promise() {
        let mut slot = PromiseSlot::resolved(());
        let before = slot.promise();

        slot.ensure_rejected(StreamError::released());

        assert!(before.peek().unwrap().is_ok());
        assert!(slot.promise().is_rejected());
    }

    #[test]
    fn ensure_rejected_rejects_pending_promise_in_place() {
        let mut slot = PromiseSlot::<()>::pending();
        let held = slot.promise();

        slot.ensure_rejected(StreamError::released());

        assert!(held.is_rejected());
    }
}
