//! Lazily produced results.
//!
//! The field executor hands the graph either an already-computed value or
//! a thunk that resolves to one later (spec §9 "lazy results as tagged
//! values"). Modeling this as an explicit tag, rather than always boxing a
//! future, lets the graph test the tag and schedule already-ready work
//! without an extra poll (§4.2.1: "if any of those fragments is already
//! pending... immediately schedule the unit").
//!
//! A thunk is memoized: once its future has been driven to completion,
//! every subsequent `resolve()` — including one racing a first call that
//! hasn't finished yet — observes the same `Arc`-shared value rather than
//! re-running the producing future.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OnceCell;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// A value that is either already available or produced by a one-shot
/// asynchronous thunk.
pub enum Lazy<T> {
    Ready(Arc<T>),
    Thunk(Thunk<T>),
}

impl<T> Lazy<T> {
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::Ready(Arc::new(value))
    }

    pub fn thunk<F, Fut>(produce: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        Self::Thunk(Thunk::new(produce))
    }

    /// True if resolving this value is guaranteed not to suspend.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Resolves to the shared value, awaiting the thunk at most once no
    /// matter how many times `resolve` is called.
    pub async fn resolve(&self) -> Arc<T> {
        match self {
            Self::Ready(value) => Arc::clone(value),
            Self::Thunk(thunk) => thunk.resolve().await,
        }
    }

    /// Resolves and unwraps the owned value, for a caller that holds the
    /// sole reference to this `Lazy` (the Incremental Graph's own use: it
    /// consumes each `Lazy` exactly once and nothing else clones it).
    ///
    /// Panics if another clone of the resolved `Arc` is still alive, which
    /// would mean something outside the graph raced the same `Lazy`.
    pub async fn into_inner(self) -> T {
        let arc = self.resolve().await;
        drop(self);
        Arc::try_unwrap(arc)
            .unwrap_or_else(|_| panic!("Lazy::into_inner: value has more than one live owner"))
    }
}

impl<T> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Lazy::Ready(..)"),
            Self::Thunk(_) => f.write_str("Lazy::Thunk(..)"),
        }
    }
}

/// A memoizing, single-evaluation async thunk.
pub struct Thunk<T> {
    cell: OnceCell<Arc<T>>,
    produce: RefCell<Option<BoxFuture<T>>>,
}

impl<T> Thunk<T> {
    fn new<F, Fut>(produce: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let boxed: BoxFuture<T> = Box::pin(async move { produce().await });
        Self {
            cell: OnceCell::new(),
            produce: RefCell::new(Some(boxed)),
        }
    }

    async fn resolve(&self) -> Arc<T> {
        self.cell
            .get_or_init(|| async {
                let fut = self
                    .produce
                    .borrow_mut()
                    .take()
                    .expect("Thunk::resolve driven concurrently without OnceCell coalescing");
                Arc::new(fut.await)
            })
            .await
            .clone()
    }
}
