use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of work posted to the serialized worker. Consumed exactly once.
pub type DeferredCall = Box<dyn FnOnce() + Send>;

struct QueueState {
    items: VecDeque<DeferredCall>,
    accepting: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// FIFO queue plus one dedicated worker thread.
///
/// Operations that must not run on the calling thread (typically: registering
/// with the host while the script's own load path is still executing) are
/// posted here and executed one at a time, in posting order. Calls run with the
/// queue lock released, so a deferred call may itself post further calls.
pub struct DeferQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferQueue {
    /// Spawns the worker thread. `thread_name` shows up in debuggers and panics.
    pub fn start(thread_name: &str) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState { items: VecDeque::new(), accepting: true }),
            ready: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || worker_loop(&worker_shared))
            .expect("spawn deferred-call worker thread");
        Self { shared, worker: Mutex::new(Some(worker)) }
    }

    /// Appends a call to the tail of the queue and wakes the worker. Once
    /// shutdown has been requested the call is silently dropped; the accepting
    /// check and the enqueue happen under the same lock, so a post racing
    /// shutdown either fully enqueues or fully drops.
    pub fn post(&self, call: impl FnOnce() + Send + 'static) {
        if !self.try_post(Box::new(call)) {
            log::debug!("[scripting] deferred call dropped after shutdown request");
        }
    }

    fn try_post(&self, call: DeferredCall) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if !state.accepting {
            return false;
        }
        state.items.push_back(call);
        self.shared.ready.notify_one();
        true
    }

    /// Blocks until every call posted strictly before this one has executed.
    /// Calls posted concurrently from other threads may land on either side of
    /// the barrier. Returns immediately if the queue is already shut down, and
    /// cannot hang even if shutdown discards the barrier item: the completion
    /// signal fires when the item is dropped unexecuted.
    pub fn drain_and_wait(&self) {
        struct SignalOnDrop(Arc<(Mutex<bool>, Condvar)>);

        impl Drop for SignalOnDrop {
            fn drop(&mut self) {
                let (flag, done) = &*self.0;
                *flag.lock().unwrap() = true;
                done.notify_all();
            }
        }

        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let guard = SignalOnDrop(Arc::clone(&gate));
        if !self.try_post(Box::new(move || drop(guard))) {
            return;
        }
        let (flag, done) = &*gate;
        let mut fired = flag.lock().unwrap();
        while !*fired {
            fired = done.wait(fired).unwrap();
        }
    }

    /// Stops accepting posts, discards everything still queued, and joins the
    /// worker. Subsequent posts are dropped; a second shutdown is a no-op.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.shared.state.lock().unwrap();
            state.accepting = false;
            let discarded: Vec<DeferredCall> = state.items.drain(..).collect();
            self.shared.ready.notify_all();
            discarded
        };
        if !discarded.is_empty() {
            log::debug!("[scripting] discarded {} queued deferred calls at shutdown", discarded.len());
        }
        drop(discarded);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("[scripting] deferred-call worker terminated abnormally");
            }
        }
    }
}

impl Drop for DeferQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let call = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(call) = state.items.pop_front() {
                    break call;
                }
                if !state.accepting {
                    return;
                }
                state = shared.ready.wait(state).unwrap();
            }
        };
        // Run with the lock released so the call may post further work.
        if catch_unwind(AssertUnwindSafe(call)).is_err() {
            log::warn!("[scripting] deferred call panicked; worker continues");
        }
    }
}
