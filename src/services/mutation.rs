use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::caching::{LoadError, LoadResult};
use crate::services::Loader;

type RevertFn = Box<dyn FnOnce() + Send>;

/// Optimistic-update context returned by the `on_mutate` hook.
///
/// Carries arbitrary per-mutation metadata plus an optional revert closure that
/// undoes the optimistic update if the mutation fails.
pub struct MutationContext<M> {
    revert: Option<RevertFn>,
    meta: M,
}

impl<M> MutationContext<M> {
    pub fn new(meta: M) -> Self {
        MutationContext { revert: None, meta }
    }

    pub fn with_revert(meta: M, revert: impl FnOnce() + Send + 'static) -> Self {
        MutationContext {
            revert: Some(Box::new(revert)),
            meta,
        }
    }
}

type MutateHook<R, M> = Box<dyn Fn(&R) -> MutationContext<M> + Send + Sync>;
type SuccessHook<T, M> = Box<dyn Fn(&T, &M) + Send + Sync>;
type ErrorHook<M> = Box<dyn Fn(&LoadError, M, bool) + Send + Sync>;
type SettledHook = Box<dyn Fn() + Send + Sync>;

struct State<R> {
    queue: VecDeque<R>,
    worker: Option<tokio::task::AbortHandle>,
    /// The revert closure of the mutation currently executing, parked here so
    /// that [`MutationQueue::close`] can undo the optimistic update of an
    /// aborted in-flight mutation.
    active_revert: Option<RevertFn>,
    closed: bool,
}

struct Inner<L: Loader, M> {
    loader: L,
    on_mutate: Option<MutateHook<L::Request, M>>,
    on_success: Option<SuccessHook<L::Item, M>>,
    on_error: Option<ErrorHook<M>>,
    on_settled: Option<SettledHook>,
    state: Mutex<State<L::Request>>,
}

/// Runs mutations strictly one at a time, in submission order.
///
/// Each submitted mutation is appended to a FIFO queue; a single worker task
/// drains it. Before a mutation executes, `on_mutate` produces a
/// [`MutationContext`] (the optimistic update). On failure the context's revert
/// closure runs first, then `on_error` receives the error, the metadata, and
/// whether this was the last queued mutation, so callers can distinguish "more
/// work is coming" from "the queue just drained on a failure".
///
/// A failed mutation does not stop the queue; later mutations still run.
pub struct MutationQueue<L: Loader, M = ()> {
    inner: Arc<Inner<L, M>>,
}

impl<L: Loader, M> Clone for MutationQueue<L, M> {
    fn clone(&self) -> Self {
        MutationQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Loader, M> std::fmt::Debug for MutationQueue<L, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Configures and builds a [`MutationQueue`].
pub struct MutationQueueBuilder<L: Loader, M = ()> {
    loader: L,
    on_mutate: Option<MutateHook<L::Request, M>>,
    on_success: Option<SuccessHook<L::Item, M>>,
    on_error: Option<ErrorHook<M>>,
    on_settled: Option<SettledHook>,
}

impl<L: Loader, M: Send + 'static> MutationQueueBuilder<L, M> {
    pub fn new(loader: L) -> Self {
        MutationQueueBuilder {
            loader,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Invoked synchronously as a mutation starts executing; applies the
    /// optimistic update and returns its context.
    pub fn on_mutate<F>(mut self, f: F) -> Self
    where
        F: Fn(&L::Request) -> MutationContext<M> + Send + Sync + 'static,
    {
        self.on_mutate = Some(Box::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&L::Item, &M) + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Invoked after the revert closure on failure. The final flag is true
    /// when no further mutations are queued behind the failed one.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&LoadError, M, bool) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_settled = Some(Box::new(f));
        self
    }

    pub fn build(self) -> MutationQueue<L, M> {
        MutationQueue {
            inner: Arc::new(Inner {
                loader: self.loader,
                on_mutate: self.on_mutate,
                on_success: self.on_success,
                on_error: self.on_error,
                on_settled: self.on_settled,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    worker: None,
                    active_revert: None,
                    closed: false,
                }),
            }),
        }
    }
}

impl<L: Loader, M> MutationQueue<L, M> {
    /// Mutations submitted but not yet settled, including the running one.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Stops the worker and drops queued mutations. The currently executing
    /// mutation is aborted mid-flight; its optimistic update is reverted, but
    /// its hooks do not run.
    pub fn close(&self) {
        let revert = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
            if let Some(worker) = state.worker.take() {
                worker.abort();
            }
            state.active_revert.take()
        };

        if let Some(revert) = revert {
            revert();
        }
    }
}

impl<L: Loader, M: Send + 'static> MutationQueue<L, M> {
    pub fn builder(loader: L) -> MutationQueueBuilder<L, M> {
        MutationQueueBuilder::new(loader)
    }

    /// Enqueues a mutation. It runs once all previously queued mutations have
    /// settled.
    pub fn enqueue(&self, request: L::Request) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.queue.push_back(request);
        metric!(counter("mutation.enqueue") += 1);

        if state.worker.is_none() {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(run_worker(inner));
            state.worker = Some(handle.abort_handle());
        }
    }
}

/// Drains the queue one mutation at a time and exits when it is empty.
///
/// The running mutation stays at the queue front while it executes; it is
/// popped only after its callbacks have run, so `pending` counts it and the
/// is-last flag can be computed before removal.
async fn run_worker<L: Loader, M: Send + 'static>(inner: Arc<Inner<L, M>>) {
    loop {
        let request = {
            let mut state = inner.state.lock().unwrap();
            match state.queue.front() {
                Some(request) => request.clone(),
                None => {
                    state.worker = None;
                    return;
                }
            }
        };

        let context = inner.on_mutate.as_ref().map(|hook| hook(&request));
        let (meta, revert) = match context {
            Some(context) => (Some(context.meta), context.revert),
            None => (None, None),
        };

        // Park the revert closure so close() can undo the optimistic update
        // if it aborts this mutation mid-flight.
        {
            let mut state = inner.state.lock().unwrap();
            if state.closed {
                drop(state);
                if let Some(revert) = revert {
                    revert();
                }
                return;
            }
            state.active_revert = revert;
        }

        let result = inner.loader.load(request).await;

        let (revert, is_last) = {
            let mut state = inner.state.lock().unwrap();
            (state.active_revert.take(), state.queue.len() == 1)
        };

        match result {
            Ok(value) => {
                if let (Some(hook), Some(meta)) = (&inner.on_success, &meta) {
                    hook(&value, meta);
                }
            }
            Err(err) => handle_failure(&inner, err, revert, meta, is_last),
        }

        if let Some(hook) = &inner.on_settled {
            hook();
        }

        let mut state = inner.state.lock().unwrap();
        if state.closed {
            state.worker = None;
            return;
        }
        state.queue.pop_front();
    }
}

fn handle_failure<L: Loader, M>(
    inner: &Inner<L, M>,
    err: LoadError,
    revert: Option<RevertFn>,
    meta: Option<M>,
    is_last: bool,
) {
    metric!(counter("mutation.error") += 1);
    tracing::warn!(error = %err, is_last, "Mutation failed");

    if let Some(revert) = revert {
        revert();
    }
    if let (Some(hook), Some(meta)) = (&inner.on_error, meta) {
        hook(&err, meta, is_last);
    }
}

/// A convenience alias for mutation results, mirroring loads.
pub type MutationResult<T> = LoadResult<T>;
