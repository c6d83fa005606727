//! Input ports and the per-port bounded history queue.
//!
//! Samples are kept newest-first: index 0 is the most recent delivery.
//! After every insert the queue is trimmed, first by sample count, then by
//! timestamp span. Reception runs on the owning thread only; the two
//! receive paths differ in how they handle the transmit credit of an
//! inter-thread connection (see `receive_async`).

use crate::environment::FilterEnvironment;
use crate::error::{PipeflowError, Result};
use crate::ports::connection::Semaphore;
use crate::ports::PortBase;
use crate::sample::{SharedDataSample, TIMESTAMP_RES};
use crate::services::Services;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

struct InputPortState {
    queue_size_samples: i64,
    queue_size_seconds: f64,
    interthread_dynamic_queue: bool,
    /// Newest-first history of retained samples.
    queue: VecDeque<SharedDataSample>,
    /// Outstanding transmit credits per connection semaphore, keyed by
    /// semaphore identity. Only used in dynamic-queue mode.
    semaphore_n: HashMap<usize, u32>,
}

struct InputPortInner {
    base: PortBase,
    state: Mutex<InputPortState>,
    /// Cached "filter/port" label for the profiling service.
    profiling_name: OnceLock<String>,
}

/// An input port with a bounded history queue.
///
/// `queue_size_samples` bounds the number of retained samples (≤ 0
/// disables the bound); `queue_size_seconds` bounds the retained timestamp
/// span (< 0 disables it). At least one bound must be active: a port
/// configured with neither is coerced to a one-sample queue with a warning.
#[derive(Clone)]
pub struct InputPort {
    inner: Arc<InputPortInner>,
}

impl InputPort {
    /// Create an input port on `env`. The port is not registered; call
    /// [`FilterEnvironment::add_port`](crate::environment::FilterEnvironment::add_port)
    /// with the returned handle.
    pub fn new(
        dynamic: bool,
        name: &str,
        env: &Arc<FilterEnvironment>,
        queue_size_samples: i64,
        queue_size_seconds: f64,
    ) -> Self {
        let port = InputPort {
            inner: Arc::new(InputPortInner {
                base: PortBase::new(dynamic, name, env),
                state: Mutex::new(InputPortState {
                    queue_size_samples: 1,
                    queue_size_seconds: -1.0,
                    interthread_dynamic_queue: false,
                    queue: VecDeque::new(),
                    semaphore_n: HashMap::new(),
                }),
                profiling_name: OnceLock::new(),
            }),
        };
        port.set_queue_size(queue_size_samples, queue_size_seconds);
        port
    }

    pub fn name(&self) -> String {
        self.inner.base.name().to_string()
    }

    pub fn dynamic(&self) -> bool {
        self.inner.base.dynamic()
    }

    /// Identity of this port, used for the per-port finalize cap.
    pub(crate) fn port_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Identity of the owning filter environment, or `None` once the
    /// environment has been destructed.
    pub(crate) fn environment_id(&self) -> Option<usize> {
        self.inner.base.environment().ok().map(|env| env.id())
    }

    pub(crate) fn environment(&self) -> Result<Arc<FilterEnvironment>> {
        self.inner.base.environment()
    }

    /// Change the queue bounds. A fully unbounded configuration (both
    /// dimensions ≤ 0, including 0/0) is coerced to one sample.
    pub fn set_queue_size(&self, queue_size_samples: i64, queue_size_seconds: f64) {
        let mut samples = queue_size_samples;
        if samples <= 0 && queue_size_seconds <= 0.0 {
            tracing::warn!(
                "Infinite buffering requested for port '{}'; using a one sample sized queue instead.",
                self.inner.base.name()
            );
            samples = 1;
        }
        let mut state = self.inner.state.lock();
        state.queue_size_samples = samples;
        state.queue_size_seconds = queue_size_seconds;
    }

    pub fn queue_size_samples(&self) -> i64 {
        self.inner.state.lock().queue_size_samples
    }

    pub fn queue_size_seconds(&self) -> f64 {
        self.inner.state.lock().queue_size_seconds
    }

    /// Enable or disable dynamic queueing for inter-thread connections into
    /// this port. Only legal while the filter may still change ports
    /// (Constructing..Initialized); afterwards the call is rejected with an
    /// error log.
    pub fn set_interthread_dynamic_queue(&self, enabled: bool) {
        let mut state = self.inner.state.lock();
        if state.interthread_dynamic_queue == enabled {
            return;
        }
        match self.inner.base.environment() {
            Ok(env) if env.state().allows_port_changes() => {
                state.interthread_dynamic_queue = enabled;
            }
            Ok(env) => {
                tracing::error!(
                    "Cannot change the interthread dynamic queue setting of port '{}' in state {}.",
                    self.inner.base.name(),
                    env.state()
                );
            }
            Err(e) => {
                tracing::error!("{}", e);
            }
        }
    }

    pub fn interthread_dynamic_queue(&self) -> bool {
        self.inner.state.lock().interthread_dynamic_queue
    }

    /// Number of retained samples. Must be called from the owning thread.
    pub fn queue_length(&self) -> Result<usize> {
        self.inner
            .base
            .assert_owning_thread("InputPort::queue_length")?;
        Ok(self.inner.state.lock().queue.len())
    }

    /// Return a retained sample.
    ///
    /// Exactly one of the arguments selects the lookup mode: with
    /// `delay_samples >= 0`, return the sample at that index (0 = newest);
    /// with `delay_seconds >= 0`, return the oldest sample at least that
    /// far behind the newest one. The other argument must be negative.
    pub fn get_data(&self, delay_samples: i64, delay_seconds: f64) -> Result<SharedDataSample> {
        self.inner.base.assert_owning_thread("InputPort::get_data")?;
        if delay_samples >= 0 && delay_seconds >= 0.0 {
            return Err(PipeflowError::Internal(
                "both delay_samples and delay_seconds are non-negative".to_string(),
            ));
        }
        let state = self.inner.state.lock();
        if delay_samples >= 0 {
            return state.queue.get(delay_samples as usize).cloned().ok_or_else(|| {
                PipeflowError::OutOfRange(format!(
                    "delay_samples {} exceeds queue length {}",
                    delay_samples,
                    state.queue.len()
                ))
            });
        }
        if delay_seconds >= 0.0 {
            let delay_time = delay_seconds / TIMESTAMP_RES;
            if let Some(newest) = state.queue.front() {
                let newest_ts = newest.timestamp();
                for sample in state.queue.iter() {
                    if (newest_ts - sample.timestamp()) as f64 >= delay_time {
                        return Ok(sample.clone());
                    }
                }
            }
            return Err(PipeflowError::OutOfRange(format!(
                "no retained sample is {} seconds old",
                delay_seconds
            )));
        }
        Err(PipeflowError::Internal(
            "both delay_samples and delay_seconds are negative".to_string(),
        ))
    }

    fn add_to_queue(&self, sample: &SharedDataSample) {
        let mut state = self.inner.state.lock();
        state.queue.push_front(sample.clone());
        if state.queue_size_samples > 0 {
            while state.queue.len() as i64 > state.queue_size_samples {
                state.queue.pop_back();
            }
        }
        if state.queue_size_seconds > 0.0 {
            let span_limit = state.queue_size_seconds / TIMESTAMP_RES;
            loop {
                let (front, back) = match (state.queue.front(), state.queue.back()) {
                    (Some(f), Some(b)) => (f.timestamp(), b.timestamp()),
                    _ => break,
                };
                if (front - back) as f64 > span_limit {
                    state.queue.pop_back();
                } else {
                    break;
                }
            }
        }
    }

    /// Intra-thread reception: insert and deliver.
    pub(crate) fn receive_sync(&self, sample: &SharedDataSample) {
        let env = match self.inner.base.assert_owning_thread("InputPort::receive_sync") {
            Ok(env) => env,
            Err(e) => {
                tracing::error!("{}", e);
                return;
            }
        };
        self.add_to_queue(sample);
        self.dispatch(&env);
    }

    /// Inter-thread reception, carrying the connection's transmit credit.
    ///
    /// Static queue mode returns the credit immediately, bounding the edge
    /// to `width` samples in flight. Dynamic queue mode keeps a
    /// per-semaphore count of outstanding credits and releases or reclaims
    /// credits so the edge can burst up to queue size + width while the
    /// consumer keeps up, throttling back to `width` when it does not.
    pub(crate) fn receive_async(&self, sample: &SharedDataSample, semaphore: &Arc<Semaphore>) {
        let env = match self.inner.base.assert_owning_thread("InputPort::receive_async") {
            Ok(env) => env,
            Err(e) => {
                tracing::error!("{}", e);
                return;
            }
        };
        self.add_to_queue(sample);
        let dynamic = self.inner.state.lock().interthread_dynamic_queue;
        if !dynamic {
            semaphore.release(1);
        } else {
            let mut state = self.inner.state.lock();
            let queue_len = state.queue.len() as i64;
            let key = Arc::as_ptr(semaphore) as usize;
            let n = state.semaphore_n.entry(key).or_insert(1);
            let delta = *n as i64 - queue_len;
            if delta <= 0 {
                // the queue outgrew the credits handed out; top them up
                semaphore.release((1 - delta) as u32);
                *n += (-delta) as u32;
            } else {
                // the arrival's own credit is consumed by the caller
                *n -= 1;
                for _ in 1..delta {
                    if semaphore.try_acquire() {
                        *n -= 1;
                    } else {
                        break;
                    }
                }
            }
            tracing::trace!("delta = {}: semaphore_n = {}", delta, *n);
        }
        self.dispatch(&env);
    }

    /// Forget the credit bookkeeping for `semaphore`; used when its
    /// connection is reset to a fresh credit budget.
    pub(crate) fn reset_credit_accounting(&self, semaphore: &Arc<Semaphore>) {
        let key = Arc::as_ptr(semaphore) as usize;
        self.inner.state.lock().semaphore_n.remove(&key);
    }

    /// Deliver to the filter, bracketed by the profiling hooks when a
    /// profiling service is registered.
    fn dispatch(&self, env: &Arc<FilterEnvironment>) {
        let profiler = Services::profiling();
        if let Some(profiler) = &profiler {
            let name = self
                .inner
                .profiling_name
                .get_or_init(|| format!("{}/{}", env.name(), self.inner.base.name()));
            profiler.before_port_data_changed(name);
            env.port_data_changed(self);
            profiler.after_port_data_changed(name);
        } else {
            env.port_data_changed(self);
        }
    }
}
