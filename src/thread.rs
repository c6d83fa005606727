//! Named worker threads hosting filters.
//!
//! Each worker owns a crossbeam mailbox and exactly one executor. The loop
//! processes four event kinds, strictly serially:
//!
//! - `Wake` — drain a batch of pending sample deliveries (`multi_step`);
//! - `Operation` — one lifecycle operation on every filter of this thread,
//!   synchronized with the other workers through a barrier;
//! - `Task` — a queued closure, executed on this thread (cross-thread
//!   method invocation);
//! - `Quit` — leave the loop and stop the executor.
//!
//! Because the mailbox is serial, samples can never interleave with a
//! lifecycle operation: every delivery observes a settled filter state.

use crate::environment::{FilterEnvironment, Operation};
use crate::error::{PipeflowError, Result};
use crate::executor::Executor;
use crate::plugin::FilterFactory;
use crate::ports::{InputPort, OutputPort, Port};
use crate::properties::PropertyCollection;
use crate::services::Services;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

/// An operation broadcast to every worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadOperation {
    /// Instantiate every filter of the thread from its recipe.
    Create,
    /// Run one lifecycle callback on every filter of the thread.
    Lifecycle(Operation),
    /// Drop every filter instance.
    Destruct,
}

/// Events processed by a worker thread's mailbox.
pub(crate) enum ThreadEvent {
    /// The executor has pending deliveries.
    Wake,
    /// A lifecycle operation, synchronized across all workers.
    Operation {
        op: ThreadOperation,
        sync: Arc<OperationSync>,
    },
    /// A closure to run on this thread.
    Task(Box<dyn FnOnce() + Send>),
    /// Leave the event loop.
    Quit,
}

/// Synchronization shared by all workers for one broadcast operation.
pub(crate) struct OperationSync {
    pub barrier: Barrier,
    pub done_tx: Sender<OperationOutcome>,
}

/// Per-thread completion report of a broadcast operation.
pub(crate) struct OperationOutcome {
    pub thread: String,
    pub result: Result<()>,
}

/// Dynamic port parameters taken from the graph document.
#[derive(Debug, Clone)]
pub(crate) struct DynamicPortSpec {
    pub name: String,
    pub queue_size_samples: i64,
    pub queue_size_seconds: f64,
    pub interthread_dynamic_queue: bool,
}

/// Everything needed to instantiate one filter on its owning thread.
pub(crate) struct FilterRecipe {
    pub name: String,
    pub factory: FilterFactory,
    pub properties: Arc<PropertyCollection>,
    pub dynamic_input_ports: Vec<DynamicPortSpec>,
    pub dynamic_output_ports: Vec<DynamicPortSpec>,
}

/// Controller-side handle of one named worker thread.
pub(crate) struct WorkerThread {
    name: String,
    tx: Sender<ThreadEvent>,
    executor: Arc<Executor>,
    filters: Arc<Mutex<Vec<Arc<FilterEnvironment>>>>,
    recipes: Arc<Mutex<Vec<FilterRecipe>>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn a named worker and its event loop.
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let executor = Executor::new(tx.clone());
        let filters: Arc<Mutex<Vec<Arc<FilterEnvironment>>>> = Arc::new(Mutex::new(Vec::new()));
        let recipes: Arc<Mutex<Vec<FilterRecipe>>> = Arc::new(Mutex::new(Vec::new()));
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let name = name.to_string();
                let executor = executor.clone();
                let filters = filters.clone();
                let recipes = recipes.clone();
                move || run(name, rx, executor, filters, recipes)
            })
            .map_err(|e| {
                PipeflowError::Internal(format!("failed to spawn thread '{}': {}", name, e))
            })?;
        Ok(WorkerThread {
            name: name.to_string(),
            tx,
            executor,
            filters,
            recipes,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn sender(&self) -> &Sender<ThreadEvent> {
        &self.tx
    }

    /// Filters hosted on this thread (populated by the create operation).
    pub fn filters(&self) -> Vec<Arc<FilterEnvironment>> {
        self.filters.lock().clone()
    }

    pub fn add_recipe(&self, recipe: FilterRecipe) {
        self.recipes.lock().push(recipe);
    }

    /// Queue a closure on this thread's event loop.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tx
            .send(ThreadEvent::Task(Box::new(task)))
            .map_err(|_| PipeflowError::ThreadNotFound(self.name.clone()))
    }

    /// Ask the loop to exit and wait for it.
    pub fn quit_and_join(&mut self) {
        let _ = self.tx.send(ThreadEvent::Quit);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("worker thread '{}' panicked", self.name);
            }
        }
    }
}

fn run(
    thread_name: String,
    rx: Receiver<ThreadEvent>,
    executor: Arc<Executor>,
    filters: Arc<Mutex<Vec<Arc<FilterEnvironment>>>>,
    recipes: Arc<Mutex<Vec<FilterRecipe>>>,
) {
    executor.bind_to_current_thread();
    tracing::debug!("worker thread '{}' started", thread_name);
    while let Ok(event) = rx.recv() {
        match event {
            ThreadEvent::Wake => executor.multi_step(),
            ThreadEvent::Task(task) => task(),
            ThreadEvent::Operation { op, sync } => {
                let result =
                    perform_operation(&thread_name, op, &sync, &executor, &filters, &recipes);
                let _ = sync.done_tx.send(OperationOutcome {
                    thread: thread_name.clone(),
                    result,
                });
            }
            ThreadEvent::Quit => break,
        }
    }
    executor.clear();
    tracing::debug!("worker thread '{}' exiting", thread_name);
}

fn perform_operation(
    thread_name: &str,
    op: ThreadOperation,
    sync: &OperationSync,
    executor: &Arc<Executor>,
    filters: &Arc<Mutex<Vec<Arc<FilterEnvironment>>>>,
    recipes: &Arc<Mutex<Vec<FilterRecipe>>>,
) -> Result<()> {
    // all workers enter the operation before any filter moves
    sync.barrier.wait();
    match op {
        ThreadOperation::Create => create_filters(thread_name, executor, filters, recipes),
        ThreadOperation::Destruct => {
            let envs: Vec<_> = filters.lock().drain(..).collect();
            for env in envs {
                env.destruct();
            }
            Ok(())
        }
        ThreadOperation::Lifecycle(op) => {
            let envs = filters.lock().clone();
            let mut first_err = None;
            // phase 1: every filter graph-wide enters the transitional state
            for env in &envs {
                if let Err(e) = env.pre_transition(op) {
                    tracing::error!("{}", e);
                    first_err.get_or_insert(e);
                }
            }
            sync.barrier.wait();
            // phase 2: run the callbacks
            for env in &envs {
                if let Err(e) = env.perform(op) {
                    tracing::error!("{}", e);
                    first_err.get_or_insert(e);
                }
            }
            match op {
                Operation::Start => {
                    if let Some(profiler) = Services::profiling() {
                        profiler.register_thread();
                    }
                }
                Operation::Stop => {
                    // drain in-flight samples so blocked producers get
                    // their credits back before the graph closes
                    executor.finalize();
                    if let Some(profiler) = Services::profiling() {
                        profiler.deregister_thread();
                    }
                }
                _ => {}
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }
}

fn create_filters(
    thread_name: &str,
    executor: &Arc<Executor>,
    filters: &Arc<Mutex<Vec<Arc<FilterEnvironment>>>>,
    recipes: &Arc<Mutex<Vec<FilterRecipe>>>,
) -> Result<()> {
    let mut first_err = None;
    for recipe in recipes.lock().iter() {
        let env = FilterEnvironment::new(
            &recipe.name,
            thread_name,
            executor.clone(),
            recipe.properties.clone(),
        );
        match (recipe.factory)(&env) {
            Ok(filter) => {
                env.set_filter(filter);
                for spec in &recipe.dynamic_input_ports {
                    let port = InputPort::new(
                        true,
                        &spec.name,
                        &env,
                        spec.queue_size_samples,
                        spec.queue_size_seconds,
                    );
                    if spec.interthread_dynamic_queue {
                        port.set_interthread_dynamic_queue(true);
                    }
                    if let Err(e) = env.add_port(Port::Input(port)) {
                        tracing::error!("{}", e);
                        first_err.get_or_insert(e);
                    }
                }
                for spec in &recipe.dynamic_output_ports {
                    let port = OutputPort::new(true, &spec.name, &env);
                    if let Err(e) = env.add_port(Port::Output(port)) {
                        tracing::error!("{}", e);
                        first_err.get_or_insert(e);
                    }
                }
                env.mark_constructed();
                tracing::debug!(
                    "created filter '{}' in thread '{}'",
                    recipe.name,
                    thread_name
                );
                filters.lock().push(env);
            }
            Err(e) => {
                let err = PipeflowError::plugin(recipe.name.as_str(), "factory", e);
                tracing::error!("{}", err);
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The named thread pool of an active application.
pub(crate) struct ThreadPool {
    threads: Vec<WorkerThread>,
    done_tx: Sender<OperationOutcome>,
    done_rx: Receiver<OperationOutcome>,
}

impl ThreadPool {
    pub fn new() -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        ThreadPool {
            threads: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    pub fn get(&self, name: &str) -> Option<&WorkerThread> {
        self.threads.iter().find(|t| t.name() == name)
    }

    pub fn get_or_spawn(&mut self, name: &str) -> Result<&WorkerThread> {
        if self.get(name).is_none() {
            let worker = WorkerThread::spawn(name)?;
            self.threads.push(worker);
        }
        Ok(self.get(name).expect("thread was just spawned"))
    }

    pub fn threads(&self) -> &[WorkerThread] {
        &self.threads
    }

    /// Run `op` on every worker and wait for all of them to complete.
    /// Returns the first per-thread error, if any.
    pub fn broadcast(&self, op: ThreadOperation) -> Result<()> {
        if self.threads.is_empty() {
            return Ok(());
        }
        let sync = Arc::new(OperationSync {
            barrier: Barrier::new(self.threads.len()),
            done_tx: self.done_tx.clone(),
        });
        for thread in &self.threads {
            thread
                .tx
                .send(ThreadEvent::Operation {
                    op,
                    sync: sync.clone(),
                })
                .map_err(|_| {
                    PipeflowError::Internal(format!(
                        "worker thread '{}' is not accepting operations",
                        thread.name()
                    ))
                })?;
        }
        let mut first_err = None;
        for _ in 0..self.threads.len() {
            match self.done_rx.recv() {
                Ok(outcome) => {
                    if let Err(e) = outcome.result {
                        tracing::error!("operation failed in thread '{}': {}", outcome.thread, e);
                        first_err.get_or_insert(e);
                    }
                }
                Err(_) => {
                    return Err(PipeflowError::Internal(
                        "a worker thread disappeared during an operation".to_string(),
                    ))
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop all workers and wait for them.
    pub fn shutdown(&mut self) {
        for thread in &mut self.threads {
            thread.quit_and_join();
        }
        self.threads.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, FilterState};
    use std::thread::ThreadId;

    struct ThreadProbe {
        constructed_on: ThreadId,
        seen: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl Filter for ThreadProbe {
        fn on_init(&mut self) -> Result<()> {
            assert_eq!(std::thread::current().id(), self.constructed_on);
            self.seen.lock().push(std::thread::current().id());
            Ok(())
        }
    }

    fn probe_recipe(name: &str, seen: &Arc<Mutex<Vec<ThreadId>>>) -> FilterRecipe {
        let seen = seen.clone();
        FilterRecipe {
            name: name.to_string(),
            factory: Arc::new(move |_env| {
                Ok(Box::new(ThreadProbe {
                    constructed_on: std::thread::current().id(),
                    seen: seen.clone(),
                }) as Box<dyn Filter>)
            }),
            properties: Arc::new(PropertyCollection::new()),
            dynamic_input_ports: Vec::new(),
            dynamic_output_ports: Vec::new(),
        }
    }

    #[test]
    fn test_filters_run_on_their_threads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pool = ThreadPool::new();
        pool.get_or_spawn("alpha").unwrap();
        pool.get_or_spawn("beta").unwrap();
        pool.get("alpha").unwrap().add_recipe(probe_recipe("a", &seen));
        pool.get("beta").unwrap().add_recipe(probe_recipe("b", &seen));

        pool.broadcast(ThreadOperation::Create).unwrap();
        assert_eq!(pool.get("alpha").unwrap().filters().len(), 1);
        assert_eq!(pool.get("beta").unwrap().filters().len(), 1);

        pool.broadcast(ThreadOperation::Lifecycle(Operation::Init))
            .unwrap();
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert_ne!(seen[0], seen[1]);
        }
        for worker in pool.threads() {
            for env in worker.filters() {
                assert_eq!(env.state(), FilterState::Initialized);
            }
        }
        pool.broadcast(ThreadOperation::Lifecycle(Operation::Deinit))
            .unwrap();
        pool.broadcast(ThreadOperation::Destruct).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_factory_failure_fails_create() {
        let mut pool = ThreadPool::new();
        pool.get_or_spawn("solo").unwrap();
        pool.get("solo").unwrap().add_recipe(FilterRecipe {
            name: "broken".to_string(),
            factory: Arc::new(|_env| {
                Err(PipeflowError::Internal("no hardware".to_string()))
            }),
            properties: Arc::new(PropertyCollection::new()),
            dynamic_input_ports: Vec::new(),
            dynamic_output_ports: Vec::new(),
        });
        let result = pool.broadcast(ThreadOperation::Create);
        assert!(matches!(result, Err(PipeflowError::Plugin { .. })));
        assert!(pool.get("solo").unwrap().filters().is_empty());
        pool.shutdown();
    }

    #[test]
    fn test_posted_tasks_run_on_worker() {
        let mut pool = ThreadPool::new();
        pool.get_or_spawn("tasker").unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.get("tasker")
            .unwrap()
            .post(move || {
                let _ = tx.send(std::thread::current().id());
            })
            .unwrap();
        let worker_id = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("task did not run");
        assert_ne!(worker_id, std::thread::current().id());
        pool.shutdown();
    }
}
