use crate::allocation::{Allocation, AllocationBudget, Type};
use crate::config::HarnessConfig;
use crate::element::Element;
use crate::error::{HarnessError, Result};
use crate::foreach::{check_launch, Executor, LaunchOptions};
use crate::lifecycle::{ContextLifecycle, LifecycleState};
use crate::script::{Script, ScriptEnv, Value};
use crate::signal::{CompletionWaiter, ValidationMessage};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// State shared between a context, its allocations and its worker.
#[derive(Debug)]
pub(crate) struct ContextShared {
    lifecycle: Mutex<ContextLifecycle>,
    pub(crate) waiter: CompletionWaiter,
    pub(crate) budget: AllocationBudget,
    next_allocation_id: AtomicU64,
}

impl ContextShared {
    pub(crate) fn ensure_active(&self) -> Result<()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ensure_active()
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub(crate) fn next_allocation_id(&self) -> u64 {
        self.next_allocation_id.fetch_add(1, Ordering::Relaxed)
    }
}

type Job = Box<dyn FnOnce(&mut Executor) -> Result<()> + Send>;

struct Command {
    label: String,
    job: Job,
}

/// A script loaded into a context.
pub struct ScriptHandle<T: Element> {
    script: Arc<Script<T>>,
    owner: Arc<ContextShared>,
}

impl<T: Element> Clone for ScriptHandle<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
            owner: Arc::clone(&self.owner),
        }
    }
}

impl<T: Element> ScriptHandle<T> {
    pub fn name(&self) -> &str {
        self.script.name()
    }

    /// Reads a global. Only meaningful after `finish`.
    pub fn global(&self, name: &str) -> Result<Value<T>> {
        self.owner.ensure_active()?;
        self.script.global(name)
    }
}

/// A compute session: owns allocations, scripts and one FIFO work queue.
///
/// Submissions return immediately; `finish` and `wait_for_message` are the
/// only calls that block.
pub struct ComputeContext {
    shared: Arc<ContextShared>,
    config: HarnessConfig,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl ComputeContext {
    pub fn create(config: HarnessConfig) -> Result<Self> {
        let mut lifecycle = ContextLifecycle::new();
        lifecycle.activate()?;

        let shared = Arc::new(ContextShared {
            lifecycle: Mutex::new(lifecycle),
            waiter: CompletionWaiter::new(),
            budget: AllocationBudget::new(config.max_allocation_bytes),
            next_allocation_id: AtomicU64::new(1),
        });

        let executor = Executor::new(&config)?;
        let (sender, receiver) = mpsc::channel();
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rs-context".to_string())
                .spawn(move || worker_loop(receiver, executor, shared))
                .map_err(|e| HarnessError::Lifecycle(format!("failed to spawn worker: {e}")))?
        };

        log::info!(
            "compute context created (budget {} bytes, message timeout {:?})",
            config.max_allocation_bytes,
            config.message_timeout()
        );
        Ok(Self {
            shared,
            config,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Bytes currently held by live allocations.
    pub fn allocated_bytes(&self) -> u64 {
        self.shared.budget.used()
    }

    /// Submissions not yet executed.
    pub fn pending(&self) -> u64 {
        self.shared.waiter.pending()
    }

    // --- allocation ---

    pub fn create_typed<T: Element>(&self, ty: Type) -> Result<Allocation<T>> {
        self.shared.ensure_active()?;
        Allocation::new(&self.shared, ty)
    }

    pub fn create_buffer<T: Element>(&self, dim_x: u32, dim_y: u32) -> Result<Allocation<T>> {
        self.create_typed(Type::of::<T>(dim_x, dim_y)?)
    }

    pub fn create_sized<T: Element>(&self, len: u32) -> Result<Allocation<T>> {
        self.create_buffer(len, 1)
    }

    // --- submission ---

    pub fn load_script<T: Element>(&self, script: Script<T>) -> Result<ScriptHandle<T>> {
        self.shared.ensure_active()?;
        log::debug!("script `{}` loaded: {script:?}", script.name());
        Ok(ScriptHandle {
            script: Arc::new(script),
            owner: Arc::clone(&self.shared),
        })
    }

    pub fn set_global<T: Element>(
        &self,
        script: &ScriptHandle<T>,
        name: &str,
        value: Value<T>,
    ) -> Result<()> {
        self.check_script(script)?;
        self.check_values(std::slice::from_ref(&value))?;

        let target = Arc::clone(&script.script);
        let global = name.to_string();
        self.submit(format!("set {}.{name}", script.name()), move |_| {
            target.store_global(&global, value);
            Ok(())
        })
    }

    /// Queues a call to a scalar entry point.
    pub fn invoke<T: Element>(
        &self,
        script: &ScriptHandle<T>,
        name: &str,
        args: &[Value<T>],
    ) -> Result<()> {
        self.check_script(script)?;
        let invokable = script.script.invokable(name)?;
        self.check_values(args)?;

        let target = Arc::clone(&script.script);
        let args = args.to_vec();
        let shared = Arc::clone(&self.shared);
        self.submit(format!("invoke {}.{name}", script.name()), move |executor| {
            let mut env = ScriptEnv::new(&target, executor, &shared.waiter);
            invokable(&mut env, &args)
        })
    }

    /// Queues an elementwise launch of a one-input kernel over `input`.
    pub fn for_each<T: Element>(
        &self,
        script: &ScriptHandle<T>,
        kernel: &str,
        input: &Allocation<T>,
        output: &Allocation<T>,
    ) -> Result<()> {
        self.for_each_with(script, kernel, &[input], output, None)
    }

    /// Queues an elementwise launch. Shapes are checked here, so a mismatch
    /// fails before anything is queued.
    pub fn for_each_with<T: Element>(
        &self,
        script: &ScriptHandle<T>,
        kernel: &str,
        inputs: &[&Allocation<T>],
        output: &Allocation<T>,
        options: Option<LaunchOptions>,
    ) -> Result<()> {
        self.check_script(script)?;
        let k = script.script.kernel(kernel)?.clone();
        for allocation in inputs.iter().copied().chain(std::iter::once(output)) {
            self.check_allocation(allocation)?;
        }
        let window = check_launch(kernel, &k, inputs, output, options)?;

        let inputs: Vec<Allocation<T>> = inputs.iter().map(|a| (*a).clone()).collect();
        let output = output.clone();
        let name = kernel.to_string();
        self.submit(format!("forEach {}.{kernel}", script.name()), move |executor| {
            let refs: Vec<&Allocation<T>> = inputs.iter().collect();
            executor.launch(&name, &k, &refs, &output, window)
        })
    }

    fn submit(
        &self,
        label: String,
        job: impl FnOnce(&mut Executor) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.shared.ensure_active()?;
        if let Some(err) = self.shared.waiter.failure() {
            log::debug!("rejecting `{label}`: context is poisoned");
            return Err(err);
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| HarnessError::Lifecycle("work queue is closed".to_string()))?;

        let ticket = self.shared.waiter.record_submission();
        log::debug!("submit #{ticket}: {label}");
        if sender
            .send(Command {
                label,
                job: Box::new(job),
            })
            .is_err()
        {
            self.shared.waiter.record_completion();
            return Err(HarnessError::Lifecycle("context worker has exited".to_string()));
        }
        Ok(())
    }

    fn check_script<T: Element>(&self, script: &ScriptHandle<T>) -> Result<()> {
        self.shared.ensure_active()?;
        if !Arc::ptr_eq(&script.owner, &self.shared) {
            return Err(HarnessError::InvalidArgument(format!(
                "script `{}` belongs to another context",
                script.name()
            )));
        }
        Ok(())
    }

    fn check_allocation<T: Element>(&self, allocation: &Allocation<T>) -> Result<()> {
        if !allocation.owned_by(&self.shared) {
            return Err(HarnessError::InvalidArgument(format!(
                "allocation #{} belongs to another context",
                allocation.id()
            )));
        }
        Ok(())
    }

    fn check_values<T: Element>(&self, values: &[Value<T>]) -> Result<()> {
        for value in values {
            if let Value::Allocation(allocation) = value {
                self.check_allocation(allocation)?;
            }
        }
        Ok(())
    }

    // --- completion ---

    /// Blocks until all work submitted so far has run.
    pub fn finish(&self) -> Result<()> {
        self.shared.ensure_active()?;
        self.shared
            .waiter
            .wait_for_completion(self.config.finish_timeout())
    }

    /// Blocks until a script posts a message, and consumes it.
    pub fn wait_for_message(&self) -> Result<ValidationMessage> {
        self.shared.ensure_active()?;
        self.shared
            .waiter
            .wait_for_message(self.config.message_timeout())
    }

    // --- teardown ---

    /// Drains the queue, stops the worker and invalidates every allocation
    /// and script handle. Calling it twice is an error.
    pub fn destroy(&mut self) -> Result<()> {
        self.shared.ensure_active().map_err(|_| {
            HarnessError::Lifecycle(format!("cannot destroy a context that is {}", self.state()))
        })?;

        // Closing the channel lets the worker drain what is queued and exit.
        drop(self.sender.take());
        let joined = match self.worker.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        };

        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .destroy()?;
        log::info!("compute context destroyed");

        joined.map_err(|_| HarnessError::Lifecycle("context worker panicked".to_string()))
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Active {
            if let Err(e) = self.destroy() {
                log::warn!("error while tearing down compute context: {e}");
            }
        }
    }
}

fn worker_loop(receiver: Receiver<Command>, mut executor: Executor, shared: Arc<ContextShared>) {
    while let Ok(Command { label, job }) = receiver.recv() {
        if shared.waiter.failure().is_some() {
            log::warn!("skipping `{label}`: context is poisoned");
        } else {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&mut executor)));
            match outcome {
                Ok(Ok(())) => log::debug!("done: {label}"),
                Ok(Err(e)) => shared.waiter.record_failure(e),
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string());
                    shared.waiter.record_failure(HarnessError::kernel_failed(label, reason));
                }
            }
        }
        shared.waiter.record_completion();
    }
    log::debug!("context worker exiting");
}
