//! Per-thread cooperative scheduler.
//!
//! Every worker thread owns exactly one `Executor`. Producers (from any
//! thread) append pending receive events; the owning thread drains them one
//! at a time, each tick delivering at most one sample to a filter callback.
//!
//! Wake-ups are coalesced: the first event registered after a drain posts a
//! single `Wake` message to the thread's mailbox; `multi_step` (the
//! mailbox's handler) processes a bounded batch and re-arms itself if work
//! remains.
//!
//! The blocked-filter set serves two purposes:
//! - a producer cooperatively pumping this executor while it waits for a
//!   transmit credit must not re-enter its own `on_port_data_changed`;
//! - a filter whose callback is currently on the stack must not be entered
//!   again — its events stay queued until the callback unwinds.
//!
//! Eligibility is evaluated in queue order, so per-connection FIFO is
//! preserved in both cases.

use crate::ports::connection::Semaphore;
use crate::ports::InputPort;
use crate::sample::SharedDataSample;
use crate::thread::ThreadEvent;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Maximum number of events a single `multi_step` invocation processes.
pub const MAX_EVENTS_PER_STEP: usize = 32;

/// Wall-clock budget of a single `multi_step` invocation. The running
/// callback always completes; the deadline is checked between events.
pub const STEP_DEADLINE: Duration = Duration::from_millis(100);

/// Maximum number of deliveries per input port during `finalize`.
pub const MAX_LOOPS_FINALIZE: usize = 5;

struct ReceiveEvent {
    input: InputPort,
    sample: SharedDataSample,
    /// `Some` for inter-thread deliveries that carry a transmit credit.
    semaphore: Option<Arc<Semaphore>>,
}

/// The per-thread scheduler draining pending input deliveries.
pub struct Executor {
    pending: Mutex<VecDeque<ReceiveEvent>>,
    blocked: Mutex<HashSet<usize>>,
    stopped: AtomicBool,
    wake_queued: AtomicBool,
    wake_tx: Sender<ThreadEvent>,
    thread_id: OnceLock<ThreadId>,
}

impl Executor {
    /// Create an executor whose wake-ups are posted to `wake_tx` (the
    /// owning thread's mailbox).
    pub(crate) fn new(wake_tx: Sender<ThreadEvent>) -> Arc<Self> {
        Arc::new(Executor {
            pending: Mutex::new(VecDeque::new()),
            blocked: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            wake_queued: AtomicBool::new(false),
            wake_tx,
            thread_id: OnceLock::new(),
        })
    }

    /// Record the current thread as this executor's owning thread. Called
    /// once by the worker loop before it starts processing events.
    pub(crate) fn bind_to_current_thread(&self) {
        let _ = self.thread_id.set(std::thread::current().id());
    }

    /// The owning thread, once bound.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get().copied()
    }

    /// Append a receive event originating from the executor's own thread.
    pub fn register_pending_rcv_sync(&self, input: &InputPort, sample: &SharedDataSample) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.pending.lock().push_back(ReceiveEvent {
            input: input.clone(),
            sample: sample.clone(),
            semaphore: None,
        });
        self.request_wake();
    }

    /// Append a receive event originating from another thread, carrying the
    /// transmit credit of its inter-thread connection.
    pub fn register_pending_rcv_async(
        &self,
        input: &InputPort,
        sample: &SharedDataSample,
        semaphore: &Arc<Semaphore>,
    ) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.pending.lock().push_back(ReceiveEvent {
            input: input.clone(),
            sample: sample.clone(),
            semaphore: Some(semaphore.clone()),
        });
        self.request_wake();
    }

    fn request_wake(&self) {
        if !self.wake_queued.swap(true, Ordering::AcqRel) {
            // mailbox gone means the thread is shutting down; nothing to do
            let _ = self.wake_tx.send(ThreadEvent::Wake);
        }
    }

    /// Mark `filter_id` as blocked for the lifetime of the returned guard.
    pub(crate) fn block_scope(&self, filter_id: usize) -> BlockScope<'_> {
        let inserted = self.blocked.lock().insert(filter_id);
        BlockScope {
            executor: self,
            filter_id,
            inserted,
        }
    }

    /// Process at most one pending event. `from_filter` is blocked for the
    /// duration, so a cooperatively pumping producer never re-enters
    /// itself. Returns true if an event was delivered.
    pub fn step(&self, from_filter: Option<usize>) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let _guard = from_filter.map(|id| self.block_scope(id));
        let ev = {
            let mut pending = self.pending.lock();
            let blocked = self.blocked.lock();
            let idx = pending.iter().position(|ev| match ev.input.environment_id() {
                Some(id) => !blocked.contains(&id),
                // environment already destructed; drain the stale event
                None => true,
            });
            match idx {
                Some(i) => pending.remove(i),
                None => None,
            }
        };
        match ev {
            Some(ev) => {
                self.deliver(ev);
                true
            }
            None => false,
        }
    }

    /// Mailbox handler for a wake-up: process up to [`MAX_EVENTS_PER_STEP`]
    /// events or until [`STEP_DEADLINE`] elapses, then re-arm if work is
    /// still pending.
    pub fn multi_step(&self) {
        self.wake_queued.store(false, Ordering::Release);
        let deadline = Instant::now() + STEP_DEADLINE;
        let mut processed = 0;
        while processed < MAX_EVENTS_PER_STEP {
            if !self.step(None) {
                return;
            }
            processed += 1;
            if Instant::now() >= deadline {
                break;
            }
        }
        if !self.pending.lock().is_empty() {
            self.request_wake();
        }
    }

    /// Drain the queue during shutdown, allowing each input port at most
    /// [`MAX_LOOPS_FINALIZE`] deliveries so cyclic graphs cannot recurse
    /// forever.
    pub fn finalize(&self) {
        tracing::debug!("executor finalize starting");
        let mut num_called: HashMap<usize, usize> = HashMap::new();
        loop {
            let ev = {
                let mut pending = self.pending.lock();
                let blocked = self.blocked.lock();
                let idx = pending.iter().position(|ev| {
                    let not_blocked = ev
                        .input
                        .environment_id()
                        .map_or(true, |id| !blocked.contains(&id));
                    let calls = num_called.get(&ev.input.port_id()).copied().unwrap_or(0);
                    not_blocked && calls < MAX_LOOPS_FINALIZE
                });
                match idx {
                    Some(i) => pending.remove(i),
                    None => None,
                }
            };
            match ev {
                Some(ev) => {
                    *num_called.entry(ev.input.port_id()).or_insert(0) += 1;
                    self.deliver(ev);
                }
                None => break,
            }
        }
    }

    /// Stop the executor and discard pending events. Called at thread
    /// teardown.
    pub fn clear(&self) {
        self.stopped.store(true, Ordering::Release);
        self.pending.lock().clear();
        self.blocked.lock().clear();
    }

    /// Number of undelivered events.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn deliver(&self, ev: ReceiveEvent) {
        match ev.semaphore {
            None => ev.input.receive_sync(&ev.sample),
            Some(sem) => ev.input.receive_async(&ev.sample, &sem),
        }
    }
}

/// RAII entry in the blocked-filter set.
pub(crate) struct BlockScope<'a> {
    executor: &'a Executor,
    filter_id: usize,
    /// False when the id was already blocked by an enclosing scope; only
    /// the scope that inserted the id removes it.
    inserted: bool,
}

impl Drop for BlockScope<'_> {
    fn drop(&mut self) {
        if self.inserted {
            self.executor.blocked.lock().remove(&self.filter_id);
        }
    }
}
