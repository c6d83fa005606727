//! Connection transport between an output port and an input port.
//!
//! Same-thread edges are "direct": emission enqueues a sync receive event
//! on the shared executor. Cross-thread edges go through an
//! [`InterThreadConnection`], which bounds the number of in-flight samples
//! with a credit semaphore: the producer acquires a credit per sample and
//! the consumer returns it on reception (or later, in dynamic queue mode).
//!
//! While waiting for a credit the producer thread cooperatively pumps its
//! own executor, so two threads blocked on each other's full edges keep
//! making progress instead of deadlocking.

use crate::environment::FilterEnvironment;
use crate::error::Result;
use crate::executor::Executor;
use crate::ports::{ConnectionTarget, InputPort, OutputPort};
use crate::sample::SharedDataSample;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a single credit-acquire attempt blocks before the producer
/// pumps its own executor and retries.
pub const CREDIT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// A counting semaphore with bounded-wait acquire.
pub struct Semaphore {
    count: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Add `n` credits.
    pub fn release(&self, n: u32) {
        let mut count = self.count.lock();
        *count += n;
        self.available.notify_all();
    }

    /// Take one credit without blocking. Returns false if none available.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Take one credit, blocking up to `timeout`. Returns false on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Set the credit count to `n`, discarding the previous value.
    pub fn reset(&self, n: u32) {
        let mut count = self.count.lock();
        *count = n;
        self.available.notify_all();
    }

    /// Current number of credits.
    pub fn available(&self) -> u32 {
        *self.count.lock()
    }
}

/// A cross-thread edge with credit-bounded back-pressure.
///
/// Connections start stopped; the lifecycle controller flips them to
/// running when the graph starts and back when it stops. Samples sent on a
/// stopped connection are dropped with a warning.
pub struct InterThreadConnection {
    semaphore: Arc<Semaphore>,
    /// Credit count while running; 0 disables flow control entirely.
    width: u32,
    stopped: AtomicBool,
    producer_executor: Arc<Executor>,
    /// Environment id of the producing filter; blocked during cooperative
    /// pumping so the producer never re-enters itself.
    producer_id: usize,
    consumer_executor: Arc<Executor>,
    input: InputPort,
}

impl InterThreadConnection {
    /// Called on the producer thread for every transmitted sample.
    pub(crate) fn receive_sample(&self, sample: &SharedDataSample) {
        if self.width == 0 {
            // no flow control; deliver like an ordinary queued event
            if self.stopped.load(Ordering::Acquire) {
                tracing::warn!(
                    "The inter-thread connection is set to stopped mode; data sample discarded."
                );
                return;
            }
            self.consumer_executor
                .register_pending_rcv_sync(&self.input, sample);
            return;
        }
        loop {
            if self.stopped.load(Ordering::Acquire) {
                tracing::warn!(
                    "The inter-thread connection is set to stopped mode; data sample discarded."
                );
                return;
            }
            if self.semaphore.acquire_timeout(CREDIT_ACQUIRE_TIMEOUT) {
                self.consumer_executor.register_pending_rcv_async(
                    &self.input,
                    sample,
                    &self.semaphore,
                );
                return;
            }
            // edge is full; keep this thread's deliveries moving while we
            // wait for the consumer to return a credit
            self.producer_executor.step(Some(self.producer_id));
        }
    }

    /// Stop or restart the connection. Restarting resets the credit budget
    /// to the configured width and clears the consumer port's credit
    /// bookkeeping for this edge. Thread safe.
    pub fn set_stopped(&self, stopped: bool) {
        if !stopped && self.width > 0 {
            self.semaphore.reset(self.width);
            self.input.reset_credit_accounting(&self.semaphore);
        }
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// The connection's credit semaphore (observable for diagnostics).
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }
}

/// Attach a same-thread connection from `output` to `input`.
pub fn setup_direct_connection(output: &OutputPort, input: &InputPort) -> Result<()> {
    let consumer_env = input.environment()?;
    tracing::debug!(
        "setup direct connection {} -> {}",
        output.name(),
        input.name()
    );
    output.add_target(ConnectionTarget::Direct {
        executor: consumer_env.executor().clone(),
        input: input.clone(),
    });
    Ok(())
}

/// Attach a cross-thread connection from `output` to `input` with `width`
/// transmit credits (0 = unbounded). The returned connection must be kept
/// alive by the caller for the lifetime of the graph.
pub fn setup_inter_thread_connection(
    output: &OutputPort,
    input: &InputPort,
    width: u32,
) -> Result<Arc<InterThreadConnection>> {
    let producer_env: Arc<FilterEnvironment> = output.environment()?;
    let consumer_env = input.environment()?;
    tracing::debug!(
        "setup inter thread connection {} -> {} (width {})",
        output.name(),
        input.name(),
        width
    );
    let connection = Arc::new(InterThreadConnection {
        semaphore: Arc::new(Semaphore::new(width)),
        width,
        stopped: AtomicBool::new(true),
        producer_executor: producer_env.executor().clone(),
        producer_id: producer_env.id(),
        consumer_executor: consumer_env.executor().clone(),
        input: input.clone(),
    });
    output.add_target(ConnectionTarget::InterThread(connection.clone()));
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release(1);
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_semaphore_timeout() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.acquire_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_semaphore_cross_thread_release() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sem2.release(1);
        });
        assert!(sem.acquire_timeout(Duration::from_millis(500)));
        handle.join().unwrap();
    }

    #[test]
    fn test_semaphore_reset() {
        let sem = Semaphore::new(5);
        assert!(sem.try_acquire());
        sem.reset(3);
        assert_eq!(sem.available(), 3);
    }
}
