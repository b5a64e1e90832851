//! Sequential and fallthrough handler composition.
//!
//! Both combinators fold any number of handlers into a single [`Handler`],
//! preserving two invariants: handlers run strictly in order, and cleanups
//! run in reverse of the order their owning handlers succeeded — whether the
//! chain finished, failed midway, or short-circuited.

use std::sync::Arc;

use super::{Cleanup, Handler, State, Step};
use crate::http::Response;

/// Reduces the errors collected from failing cleanups into one error value.
pub type ErrorReducer<E> = Arc<dyn Fn(Vec<E>) -> E + Send + Sync>;

/// Composes handlers sequentially.
///
/// Each handler receives the previous handler's state; its cleanup, if any,
/// is recorded. On the first handler error, all recorded cleanups run in
/// reverse order with no response context and the error is propagated —
/// later handlers are never invoked. On success, the final state is returned
/// together with one combined cleanup that runs the recorded cleanups in
/// reverse order; cleanup failures are collected and reduced through
/// `compose_errors` only after every cleanup has had its chance to run.
///
/// An empty handler list behaves as the identity: the initial state is
/// returned with no cleanup.
pub fn compose<E, R>(handlers: Vec<Handler<E>>, compose_errors: R) -> Handler<E>
where
    E: Send + 'static,
    R: Fn(Vec<E>) -> E + Send + Sync + 'static,
{
    let handlers = Arc::new(handlers);
    let reduce: ErrorReducer<E> = Arc::new(compose_errors);

    Arc::new(move |request, state| {
        let handlers = Arc::clone(&handlers);
        let reduce = Arc::clone(&reduce);
        Box::pin(async move {
            let mut cleanups: Vec<Cleanup<E>> = Vec::new();
            let mut state = state;

            for handler in handlers.iter() {
                match handler(Arc::clone(&request), state).await {
                    Ok(step) => {
                        state = step.state;
                        if let Some(cleanup) = step.cleanup {
                            cleanups.push(cleanup);
                        }
                    }
                    Err(error) => return Err(unwind(cleanups, error, &reduce).await),
                }
            }

            Ok(Step {
                state,
                cleanup: combine(cleanups, reduce),
            })
        })
    })
}

/// Tries handlers in order until one produces a matching state.
///
/// A handler signals "not matched, try the next one" by returning a state
/// for which `is_no_match` holds; its state flows into the next attempt and
/// its cleanup, if any, is still recorded. The first handler returning a
/// matching state short-circuits: its state is returned with the combined
/// cleanups of every handler run so far. When every handler falls through,
/// `fallback` runs with the accumulated state.
///
/// Errors behave exactly as in [`compose`]: recorded cleanups unwind in
/// reverse with no response context.
pub fn fallthrough<E, P, R>(
    handlers: Vec<Handler<E>>,
    is_no_match: P,
    fallback: Handler<E>,
    compose_errors: R,
) -> Handler<E>
where
    E: Send + 'static,
    P: Fn(&State) -> bool + Send + Sync + 'static,
    R: Fn(Vec<E>) -> E + Send + Sync + 'static,
{
    let handlers = Arc::new(handlers);
    let is_no_match = Arc::new(is_no_match);
    let reduce: ErrorReducer<E> = Arc::new(compose_errors);

    Arc::new(move |request, state| {
        let handlers = Arc::clone(&handlers);
        let fallback = Arc::clone(&fallback);
        let is_no_match = Arc::clone(&is_no_match);
        let reduce = Arc::clone(&reduce);
        Box::pin(async move {
            let mut cleanups: Vec<Cleanup<E>> = Vec::new();
            let mut state = state;

            for handler in handlers.iter() {
                match handler(Arc::clone(&request), state).await {
                    Ok(step) => {
                        if let Some(cleanup) = step.cleanup {
                            cleanups.push(cleanup);
                        }
                        if is_no_match(&step.state) {
                            state = step.state;
                            continue;
                        }
                        return Ok(Step {
                            state: step.state,
                            cleanup: combine(cleanups, reduce),
                        });
                    }
                    Err(error) => return Err(unwind(cleanups, error, &reduce).await),
                }
            }

            match fallback(request, state).await {
                Ok(step) => {
                    if let Some(cleanup) = step.cleanup {
                        cleanups.push(cleanup);
                    }
                    Ok(Step {
                        state: step.state,
                        cleanup: combine(cleanups, reduce),
                    })
                }
                Err(error) => Err(unwind(cleanups, error, &reduce).await),
            }
        })
    })
}

// Runs every cleanup in reverse insertion order, collecting failures.
// Every cleanup runs even when earlier (later-registered) ones fail.
async fn run_reverse<E>(cleanups: Vec<Cleanup<E>>, response: Option<&Response>) -> Vec<E> {
    let mut errors = Vec::new();
    for cleanup in cleanups.into_iter().rev() {
        if let Err(error) = cleanup(response).await {
            errors.push(error);
        }
    }
    errors
}

// Unwinds after a handler error: cleanups run with no response context, and
// any of their failures are folded together with the handler's own error.
async fn unwind<E>(cleanups: Vec<Cleanup<E>>, error: E, reduce: &ErrorReducer<E>) -> E {
    let mut errors = run_reverse(cleanups, None).await;
    if errors.is_empty() {
        error
    } else {
        errors.insert(0, error);
        reduce(errors)
    }
}

// Folds recorded cleanups into one reverse-running cleanup.
fn combine<E>(cleanups: Vec<Cleanup<E>>, reduce: ErrorReducer<E>) -> Option<Cleanup<E>>
where
    E: Send + 'static,
{
    if cleanups.is_empty() {
        return None;
    }
    let combined: Cleanup<E> = Box::new(move |response: Option<&Response>| {
        Box::pin(async move {
            let errors = run_reverse(cleanups, response).await;
            if errors.is_empty() {
                Ok(())
            } else {
                Err(reduce(errors))
            }
        })
    });
    Some(combined)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::handler::{cleanup, handler};
    use crate::http::Request;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    fn reduce_errors(errors: Vec<TestError>) -> TestError {
        TestError(
            errors
                .into_iter()
                .map(|e| e.0)
                .collect::<Vec<_>>()
                .join("+"),
        )
    }

    fn test_request() -> Arc<Request> {
        let (request, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        Arc::new(request)
    }

    type Log = Arc<Mutex<Vec<String>>>;

    // A handler that records `name` in state order and registers a cleanup
    // that appends `name` to the log when run.
    fn tracked(name: &'static str, log: Log) -> Handler<TestError> {
        handler(move |_request, state| {
            let log = Arc::clone(&log);
            async move {
                let teardown: Cleanup<TestError> =
                    Box::new(move |response: Option<&Response>| {
                        let saw_response = response.is_some();
                        Box::pin(async move {
                            let tag = if saw_response { "+resp" } else { "" };
                            log.lock().unwrap().push(format!("{name}{tag}"));
                            Ok(())
                        })
                    });
                Ok(Step::with_cleanup(state, teardown))
            }
        })
    }

    fn failing(name: &'static str) -> Handler<TestError> {
        handler(move |_request, _state| async move { Err(TestError(name.to_string())) })
    }

    #[tokio::test]
    async fn cleanups_run_in_reverse_order() {
        let log: Log = Arc::default();
        let chain = compose(
            vec![
                tracked("a", Arc::clone(&log)),
                tracked("b", Arc::clone(&log)),
                tracked("c", Arc::clone(&log)),
            ],
            reduce_errors,
        );

        let step = chain(test_request(), State::new()).await.unwrap();
        assert!(log.lock().unwrap().is_empty());

        let response = Response::text("done");
        step.cleanup.unwrap()(Some(&response)).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["c+resp", "b+resp", "a+resp"]
        );
    }

    #[tokio::test]
    async fn error_short_circuits_and_unwinds() {
        let log: Log = Arc::default();
        let reached_third = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached_third);
        let third: Handler<TestError> = handler(move |_request, state| {
            *flag.lock().unwrap() = true;
            async move { Ok(Step::next(state)) }
        });

        let chain = compose(
            vec![tracked("first", Arc::clone(&log)), failing("boom"), third],
            reduce_errors,
        );

        let error = chain(test_request(), State::new()).await.unwrap_err();
        assert_eq!(error, TestError("boom".into()));
        // Handler 3 never ran; handler 1's cleanup ran exactly once, with no
        // response context.
        assert!(!*reached_third.lock().unwrap());
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let chain = compose(Vec::new(), reduce_errors);
        let step = chain(test_request(), State::new().with(9u32)).await.unwrap();
        assert_eq!(step.state.get::<u32>(), Some(&9));
        assert!(step.cleanup.is_none());
    }

    #[tokio::test]
    async fn state_flows_forward() {
        let first: Handler<TestError> =
            handler(|_request, state| async move { Ok(Step::next(state.with(1u32))) });
        let second: Handler<TestError> = handler(|_request, mut state| async move {
            let n = *state.get::<u32>().unwrap();
            state.insert(n + 1);
            Ok(Step::next(state))
        });

        let chain = compose(vec![first, second], reduce_errors);
        let step = chain(test_request(), State::new()).await.unwrap();
        assert_eq!(step.state.get::<u32>(), Some(&2));
    }

    #[tokio::test]
    async fn failing_cleanups_all_run_then_reduce() {
        let log: Log = Arc::default();
        let failing_cleanup = |name: &'static str, log: Log| -> Handler<TestError> {
            handler(move |_request, state| {
                let log = Arc::clone(&log);
                async move {
                    let teardown = cleanup(move || async move {
                        log.lock().unwrap().push(name.to_string());
                        Err(TestError(name.to_string()))
                    });
                    Ok(Step::with_cleanup(state, teardown))
                }
            })
        };

        let chain = compose(
            vec![
                failing_cleanup("x", Arc::clone(&log)),
                tracked("y", Arc::clone(&log)),
                failing_cleanup("z", Arc::clone(&log)),
            ],
            reduce_errors,
        );

        let step = chain(test_request(), State::new()).await.unwrap();
        let error = step.cleanup.unwrap()(None).await.unwrap_err();
        // Both failures surfaced after every cleanup ran, reverse order.
        assert_eq!(error, TestError("z+x".into()));
        assert_eq!(*log.lock().unwrap(), vec!["z", "y", "x"]);
    }

    #[tokio::test]
    async fn unwind_folds_cleanup_failures_into_handler_error() {
        let broken_cleanup: Handler<TestError> = handler(|_request, state| async move {
            let teardown = cleanup(|| async { Err(TestError("teardown".into())) });
            Ok(Step::with_cleanup(state, teardown))
        });

        let chain = compose(vec![broken_cleanup, failing("boom")], reduce_errors);
        let error = chain(test_request(), State::new()).await.unwrap_err();
        assert_eq!(error, TestError("boom+teardown".into()));
    }

    // ── fallthrough ───────────────────────────────────────────────────────────

    // Marker a handler leaves in state to signal "not matched".
    struct NoMatch;

    fn skipping(name: &'static str, log: Log) -> Handler<TestError> {
        handler(move |_request, state| {
            let log = Arc::clone(&log);
            async move {
                let teardown = cleanup(move || async move {
                    log.lock().unwrap().push(name.to_string());
                    Ok(())
                });
                Ok(Step::with_cleanup(state.with(NoMatch), teardown))
            }
        })
    }

    fn matching(value: u32) -> Handler<TestError> {
        handler(move |_request, mut state| async move {
            state.remove::<NoMatch>();
            Ok(Step::next(state.with(value)))
        })
    }

    #[tokio::test]
    async fn first_matching_handler_wins() {
        let log: Log = Arc::default();
        let routed = fallthrough(
            vec![
                skipping("miss1", Arc::clone(&log)),
                matching(42),
                matching(99),
            ],
            |state| state.contains::<NoMatch>(),
            handler(|_request, state| async move { Ok(Step::next(state.with(0u32))) }),
            reduce_errors,
        );

        let step = routed(test_request(), State::new()).await.unwrap();
        assert_eq!(step.state.get::<u32>(), Some(&42));

        // The fallen-through handler's cleanup is part of the combined one.
        step.cleanup.unwrap()(None).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["miss1"]);
    }

    #[tokio::test]
    async fn all_fall_through_uses_fallback() {
        let log: Log = Arc::default();
        let routed = fallthrough(
            vec![
                skipping("miss1", Arc::clone(&log)),
                skipping("miss2", Arc::clone(&log)),
            ],
            |state| state.contains::<NoMatch>(),
            matching(7),
            reduce_errors,
        );

        let step = routed(test_request(), State::new()).await.unwrap();
        assert_eq!(step.state.get::<u32>(), Some(&7));

        step.cleanup.unwrap()(None).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["miss2", "miss1"]);
    }
}
