//! The handler contract: request-scoped state accumulation, one-shot
//! cleanups, and the shared [`Handler`] function shape the composition
//! engine and the dispatcher agree on.
//!
//! A handler maps `(request, state)` to a new state plus an optional
//! cleanup, or a typed error. State is a type-erased map so independent
//! handlers can each contribute their own entries without knowing about one
//! another; the terminal handler stores the final [`Response`] in it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::http::{Request, Response};

mod compose;

pub use compose::{compose, fallthrough};

/// The accumulating, request-scoped state record.
///
/// Each handler receives the previous handler's state and returns a possibly
/// extended one. Entries are keyed by type; the map is discarded after
/// dispatch.
///
/// # Examples
///
/// ```
/// use strand::handler::State;
///
/// struct UserId(u64);
///
/// let state = State::new().with(UserId(7));
/// assert_eq!(state.get::<UserId>().unwrap().0, 7);
/// ```
#[derive(Default)]
pub struct State {
    map: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl State {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value of the same type.
    pub fn insert<T: Send + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with<T: Send + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Returns a reference to the value of type `T`, if present.
    pub fn get<T: Send + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns a mutable reference to the value of type `T`, if present.
    pub fn get_mut<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes and returns the value of type `T`, if present.
    pub fn remove<T: Send + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Returns `true` if a value of type `T` is present.
    pub fn contains<T: Send + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "State({} entries)", self.map.len())
    }
}

/// The future returned by a cleanup, possibly borrowing the response.
pub type CleanupFuture<'a, E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'a>>;

/// A one-shot teardown callback.
///
/// Invoked at most once, by the framework, after the final response is known
/// — with `Some(response)` when the chain produced one, `None` when the
/// chain failed before a response existed. The cleanup's owning handler
/// acquires; the framework releases.
pub type Cleanup<E> = Box<dyn for<'a> FnOnce(Option<&'a Response>) -> CleanupFuture<'a, E> + Send>;

/// A successful handler result: the extended state plus an optional cleanup.
pub struct Step<E> {
    pub state: State,
    pub cleanup: Option<Cleanup<E>>,
}

impl<E> Step<E> {
    /// A step with no cleanup.
    pub fn next(state: State) -> Self {
        Self {
            state,
            cleanup: None,
        }
    }

    /// A step that registers a cleanup.
    pub fn with_cleanup(state: State, cleanup: Cleanup<E>) -> Self {
        Self {
            state,
            cleanup: Some(cleanup),
        }
    }
}

impl<E> std::fmt::Debug for Step<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("state", &self.state)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// The future returned by a handler.
pub type HandlerFuture<E> = Pin<Box<dyn Future<Output = Result<Step<E>, E>> + Send>>;

/// A type-erased, reference-counted handler function.
///
/// The request is shared immutably via [`Arc`] so any number of handlers
/// (and their futures) can read it without copying.
pub type Handler<E> = Arc<dyn Fn(Arc<Request>, State) -> HandlerFuture<E> + Send + Sync>;

/// Boxes an async closure into a [`Handler`].
///
/// # Examples
///
/// ```
/// use strand::handler::{Step, handler};
/// use strand::http::Response;
///
/// let hello = handler::<std::io::Error, _, _>(|_request, state| async move {
///     Ok(Step::next(state.with(Response::text("hello"))))
/// });
/// drop(hello);
/// ```
pub fn handler<E, F, Fut>(f: F) -> Handler<E>
where
    F: Fn(Arc<Request>, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Step<E>, E>> + Send + 'static,
{
    Arc::new(move |request, state| Box::pin(f(request, state)))
}

/// Boxes an async teardown that does not inspect the response.
///
/// Cleanups that need the response take it directly — note the annotated
/// parameter, which makes the closure generic over the borrow:
/// `Box::new(|response: Option<&Response>| Box::pin(async move { … }))`.
pub fn cleanup<E, F, Fut>(f: F) -> Cleanup<E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Box::new(move |_response: Option<&Response>| Box::pin(f()))
}
