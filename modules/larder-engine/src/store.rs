//! The dispatch loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::action::Action;
use crate::diagnostics::Diagnostic;
use crate::error::SliceError;
use crate::state::StateTree;
use crate::traits::{Middleware, RootReducer};

const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

/// A committed tree. Revision 0 is the initial state; every commit adds one.
#[derive(Debug, Clone)]
pub struct Committed {
    pub revision: u64,
    pub tree: Arc<StateTree>,
}

/// What happened to a dispatched action by the time `dispatch` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Applied on this call, along with anything queued behind it.
    Applied,
    /// Another caller is draining the queue; the action runs after the
    /// actions ahead of it.
    Queued,
    /// The store has not opened yet; the action runs after `Store::open`.
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&StateTree) + Send + Sync>;

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<Action>,
    held: VecDeque<Action>,
    draining: bool,
    open: bool,
}

struct Shared {
    this: Weak<Shared>,
    reducer: Box<dyn RootReducer>,
    middleware: Vec<Arc<dyn Middleware>>,
    queue: Mutex<DispatchQueue>,
    commits: watch::Sender<Committed>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    diagnostics: broadcast::Sender<Diagnostic>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the draining flag if a reducer or middleware panics mid-drain, so
/// later dispatches are not stuck behind a drainer that no longer exists.
struct DrainGuard<'a> {
    queue: &'a Mutex<DispatchQueue>,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.queue).draining = false;
        }
    }
}

impl Shared {
    fn enqueue(&self, action: Action) -> Dispatched {
        {
            let mut queue = lock(&self.queue);
            queue.pending.push_back(action);
            if queue.draining {
                return Dispatched::Queued;
            }
            queue.draining = true;
        }
        self.drain();
        Dispatched::Applied
    }

    /// Apply queued actions one at a time until the queue is empty.
    /// Actions dispatched while applying (by middleware or listeners) land
    /// at the back of the queue, so processing is breadth-first.
    fn drain(&self) {
        let mut guard = DrainGuard {
            queue: &self.queue,
            finished: false,
        };
        loop {
            let action = {
                let mut queue = lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(action) => action,
                    None => {
                        queue.draining = false;
                        guard.finished = true;
                        return;
                    }
                }
            };
            self.apply(&action);
        }
    }

    fn apply(&self, action: &Action) {
        let ctx = Context { shared: self };
        Next {
            chain: &self.middleware,
            ctx: &ctx,
        }
        .run(action);
    }

    fn commit(&self, action: &Action) {
        let current = self.commits.borrow().clone();
        match self.reducer.reduce(&current.tree, action) {
            Ok(next) => {
                let tree = Arc::new(next);
                self.commits.send_replace(Committed {
                    revision: current.revision + 1,
                    tree: tree.clone(),
                });
                self.notify(&tree);
            }
            Err(err) => {
                warn!(action = action.kind(), error = %err, "Reducer failed, state unchanged");
                self.report(Diagnostic::ReducerFailed {
                    action: action.kind().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    fn notify(&self, tree: &StateTree) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(tree);
        }
    }

    fn state(&self) -> Arc<StateTree> {
        self.commits.borrow().tree.clone()
    }

    fn report(&self, diagnostic: Diagnostic) {
        // No receivers is fine; the origin already logged it.
        let _ = self.diagnostics.send(diagnostic);
    }
}

/// What middleware can see and do while handling an action.
pub struct Context<'a> {
    shared: &'a Shared,
}

impl Context<'_> {
    /// The latest committed tree. Before `next.run` this is the state the
    /// action will be applied to; after, it includes the action.
    pub fn state(&self) -> Arc<StateTree> {
        self.shared.state()
    }

    pub fn revision(&self) -> u64 {
        self.shared.commits.borrow().revision
    }

    /// Queue a follow-up action. It is applied after the current action and
    /// anything already queued.
    pub fn dispatch(&self, action: Action) {
        self.shared.enqueue(action);
    }

    /// A handle that can dispatch from outside this call, e.g. from a
    /// spawned task.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            shared: self.shared.this.clone(),
        }
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        self.shared.report(diagnostic);
    }
}

/// The rest of the middleware chain, ending in the reducer.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    ctx: &'a Context<'a>,
}

impl Next<'_> {
    pub fn run(self, action: &Action) {
        match self.chain.split_first() {
            Some((first, rest)) => first.handle(
                self.ctx,
                action,
                Next {
                    chain: rest,
                    ctx: self.ctx,
                },
            ),
            None => self.ctx.shared.commit(action),
        }
    }
}

/// Weak dispatch handle for background tasks.
///
/// Dispatches through this handle skip the boot gate: they are consequences
/// of actions the store already accepted. Once the store is dropped every
/// call is a no-op.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Weak<Shared>,
}

impl Dispatcher {
    pub fn dispatch(&self, action: Action) -> Option<Dispatched> {
        self.shared.upgrade().map(|shared| shared.enqueue(action))
    }

    pub fn state(&self) -> Option<Arc<StateTree>> {
        self.shared.upgrade().map(|shared| shared.state())
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        if let Some(shared) = self.shared.upgrade() {
            shared.report(diagnostic);
        }
    }
}

/// The single writable handle to the state tree. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Submit an action from outside the store.
    ///
    /// The reducer runs synchronously unless another caller is already
    /// draining (the action is queued behind theirs) or the store is still
    /// booting (the action is held until `open`).
    pub fn dispatch(&self, action: Action) -> Dispatched {
        {
            let mut queue = lock(&self.shared.queue);
            if !queue.open {
                debug!(action = action.kind(), "Store not open, holding action");
                queue.held.push_back(action);
                return Dispatched::Held;
            }
        }
        self.shared.enqueue(action)
    }

    /// Dispatch past the boot gate. Reserved for the boot sequence.
    pub fn dispatch_boot(&self, action: Action) -> Dispatched {
        self.shared.enqueue(action)
    }

    /// Open the boot gate and apply held actions in submission order.
    pub fn open(&self) {
        {
            let mut queue = lock(&self.shared.queue);
            if queue.open {
                return;
            }
            queue.open = true;
            let held = std::mem::take(&mut queue.held);
            if !held.is_empty() {
                debug!(count = held.len(), "Releasing held actions");
            }
            queue.pending.extend(held);
            if queue.draining || queue.pending.is_empty() {
                return;
            }
            queue.draining = true;
        }
        self.shared.drain();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.queue).open
    }

    /// The latest committed tree.
    pub fn get_state(&self) -> Arc<StateTree> {
        self.shared.state()
    }

    pub fn committed(&self) -> Committed {
        self.shared.commits.borrow().clone()
    }

    /// Register a listener called after every commit.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateTree) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Receiver that always holds the latest commit.
    pub fn watch(&self) -> watch::Receiver<Committed> {
        self.shared.commits.subscribe()
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.shared.diagnostics.subscribe()
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        self.shared.report(diagnostic);
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

#[derive(Default)]
pub struct StoreBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
    gated: bool,
    diagnostics_capacity: Option<usize>,
}

impl StoreBuilder {
    /// Append a middleware. Middleware runs in registration order.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Start closed: external dispatches are held until `Store::open`.
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = Some(capacity);
        self
    }

    pub fn build(self, reducer: impl RootReducer) -> Result<Store, SliceError> {
        let initial = reducer.initial_state()?;
        let (commits, _) = watch::channel(Committed {
            revision: 0,
            tree: Arc::new(initial),
        });
        let (diagnostics, _) = broadcast::channel(
            self.diagnostics_capacity
                .unwrap_or(DEFAULT_DIAGNOSTICS_CAPACITY),
        );
        let queue = DispatchQueue {
            open: !self.gated,
            ..DispatchQueue::default()
        };

        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            reducer: Box::new(reducer),
            middleware: self.middleware,
            queue: Mutex::new(queue),
            commits,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            diagnostics,
        });

        Ok(Store { shared })
    }
}
