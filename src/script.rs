use crate::allocation::Allocation;
use crate::element::Element;
use crate::error::{HarnessError, Result};
use crate::foreach::{Executor, LaunchOptions};
use crate::signal::{CompletionWaiter, ValidationMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub type MapFn<T> = dyn Fn(T, u32, u32) -> T + Send + Sync;
pub type ZipFn<T> = dyn Fn(T, T, u32, u32) -> T + Send + Sync;
pub type InvokableFn<T> = dyn Fn(&mut ScriptEnv<'_, T>, &[Value<T>]) -> Result<()> + Send + Sync;

/// WGSL function `fn <entry>(value: T, x: u32, y: u32) -> T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgslKernel {
    pub source: String,
    pub entry: String,
}

/// Elementwise kernel. Every flavour receives the element coordinates.
pub enum Kernel<T: Element> {
    /// `out = f(in)`
    Map(Arc<MapFn<T>>),
    /// `out = f(a, b)`
    Zip(Arc<ZipFn<T>>),
    /// `out = f(out)`, no input allocation.
    Update(Arc<MapFn<T>>),
    /// `out = f(in)` on the GPU.
    Wgsl(WgslKernel),
}

impl<T: Element> Clone for Kernel<T> {
    fn clone(&self) -> Self {
        match self {
            Kernel::Map(f) => Kernel::Map(Arc::clone(f)),
            Kernel::Zip(f) => Kernel::Zip(Arc::clone(f)),
            Kernel::Update(f) => Kernel::Update(Arc::clone(f)),
            Kernel::Wgsl(k) => Kernel::Wgsl(k.clone()),
        }
    }
}

impl<T: Element> fmt::Debug for Kernel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kernel::Map(_) => f.write_str("Kernel::Map"),
            Kernel::Zip(_) => f.write_str("Kernel::Zip"),
            Kernel::Update(_) => f.write_str("Kernel::Update"),
            Kernel::Wgsl(k) => write!(f, "Kernel::Wgsl({})", k.entry),
        }
    }
}

impl<T: Element> Kernel<T> {
    pub fn map(f: impl Fn(T, u32, u32) -> T + Send + Sync + 'static) -> Self {
        Kernel::Map(Arc::new(f))
    }

    pub fn zip(f: impl Fn(T, T, u32, u32) -> T + Send + Sync + 'static) -> Self {
        Kernel::Zip(Arc::new(f))
    }

    pub fn update(f: impl Fn(T, u32, u32) -> T + Send + Sync + 'static) -> Self {
        Kernel::Update(Arc::new(f))
    }

    pub fn wgsl(source: impl Into<String>, entry: impl Into<String>) -> Self {
        Kernel::Wgsl(WgslKernel {
            source: source.into(),
            entry: entry.into(),
        })
    }

    /// Number of input allocations a launch must supply.
    pub fn arity(&self) -> usize {
        match self {
            Kernel::Update(_) => 0,
            Kernel::Map(_) | Kernel::Wgsl(_) => 1,
            Kernel::Zip(_) => 2,
        }
    }
}

/// Argument to an invokable or value of a script global.
pub enum Value<T: Element> {
    Int(i32),
    UInt(u32),
    Float(f32),
    Allocation(Allocation<T>),
}

impl<T: Element> Clone for Value<T> {
    fn clone(&self) -> Self {
        match self {
            Value::Int(v) => Value::Int(*v),
            Value::UInt(v) => Value::UInt(*v),
            Value::Float(v) => Value::Float(*v),
            Value::Allocation(a) => Value::Allocation(a.clone()),
        }
    }
}

impl<T: Element> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "Int({v})"),
            Value::UInt(v) => write!(f, "UInt({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Allocation(a) => write!(f, "Allocation(#{})", a.id()),
        }
    }
}

impl<T: Element> From<&Allocation<T>> for Value<T> {
    fn from(allocation: &Allocation<T>) -> Self {
        Value::Allocation(allocation.clone())
    }
}

impl<T: Element> Value<T> {
    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) => i32::try_from(*v)
                .map_err(|_| HarnessError::InvalidArgument(format!("{v} does not fit in i32"))),
            other => Err(HarnessError::InvalidArgument(format!(
                "expected an integer, got {other:?}"
            ))),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match self {
            Value::UInt(v) => Ok(*v),
            Value::Int(v) => u32::try_from(*v)
                .map_err(|_| HarnessError::InvalidArgument(format!("{v} does not fit in u32"))),
            other => Err(HarnessError::InvalidArgument(format!(
                "expected an unsigned integer, got {other:?}"
            ))),
        }
    }

    pub fn as_f32(&self) -> Result<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(HarnessError::InvalidArgument(format!(
                "expected a float, got {other:?}"
            ))),
        }
    }

    pub fn as_allocation(&self) -> Result<&Allocation<T>> {
        match self {
            Value::Allocation(a) => Ok(a),
            other => Err(HarnessError::InvalidArgument(format!(
                "expected an allocation, got {other:?}"
            ))),
        }
    }
}

/// A named set of kernels and invokables sharing one set of globals.
pub struct Script<T: Element> {
    name: String,
    kernels: HashMap<String, Kernel<T>>,
    invokables: HashMap<String, Arc<InvokableFn<T>>>,
    globals: Mutex<HashMap<String, Value<T>>>,
}

impl<T: Element> fmt::Debug for Script<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kernels: Vec<_> = self.kernels.keys().collect();
        kernels.sort();
        let mut invokables: Vec<_> = self.invokables.keys().collect();
        invokables.sort();
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("kernels", &kernels)
            .field("invokables", &invokables)
            .finish()
    }
}

impl<T: Element> Script<T> {
    pub fn builder(name: impl Into<String>) -> ScriptBuilder<T> {
        ScriptBuilder {
            script: Script {
                name: name.into(),
                kernels: HashMap::new(),
                invokables: HashMap::new(),
                globals: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self, name: &str) -> Result<&Kernel<T>> {
        self.kernels
            .get(name)
            .ok_or_else(|| self.unknown(name))
    }

    pub fn invokable(&self, name: &str) -> Result<Arc<InvokableFn<T>>> {
        self.invokables
            .get(name)
            .cloned()
            .ok_or_else(|| self.unknown(name))
    }

    fn unknown(&self, name: &str) -> HarnessError {
        HarnessError::UnknownEntryPoint {
            script: self.name.clone(),
            name: name.to_string(),
        }
    }

    pub fn global(&self, name: &str) -> Result<Value<T>> {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                HarnessError::InvalidArgument(format!(
                    "global `{name}` of script `{}` was never set",
                    self.name
                ))
            })
    }

    pub(crate) fn store_global(&self, name: &str, value: Value<T>) {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
    }
}

pub struct ScriptBuilder<T: Element> {
    script: Script<T>,
}

impl<T: Element> ScriptBuilder<T> {
    pub fn kernel(mut self, name: impl Into<String>, kernel: Kernel<T>) -> Self {
        self.script.kernels.insert(name.into(), kernel);
        self
    }

    pub fn invokable(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut ScriptEnv<'_, T>, &[Value<T>]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.script.invokables.insert(name.into(), Arc::new(f));
        self
    }

    pub fn global(self, name: &str, value: Value<T>) -> Self {
        self.script.store_global(name, value);
        self
    }

    pub fn build(self) -> Script<T> {
        self.script
    }
}

/// What an invokable sees while it runs on the context worker.
pub struct ScriptEnv<'a, T: Element> {
    script: &'a Script<T>,
    executor: &'a mut Executor,
    waiter: &'a CompletionWaiter,
}

impl<'a, T: Element> ScriptEnv<'a, T> {
    pub(crate) fn new(
        script: &'a Script<T>,
        executor: &'a mut Executor,
        waiter: &'a CompletionWaiter,
    ) -> Self {
        Self {
            script,
            executor,
            waiter,
        }
    }

    pub fn script_name(&self) -> &str {
        self.script.name()
    }

    pub fn global(&self, name: &str) -> Result<Value<T>> {
        self.script.global(name)
    }

    pub fn global_i32(&self, name: &str) -> Result<i32> {
        self.script.global(name)?.as_i32()
    }

    pub fn set_global(&self, name: &str, value: Value<T>) {
        self.script.store_global(name, value);
    }

    /// Launches a kernel of this script and waits for it.
    pub fn for_each(
        &mut self,
        kernel: &str,
        inputs: &[&Allocation<T>],
        output: &Allocation<T>,
        options: Option<LaunchOptions>,
    ) -> Result<()> {
        let script = self.script;
        let k = script.kernel(kernel)?;
        let window = crate::foreach::check_launch(kernel, k, inputs, output, options)?;
        self.executor.launch(kernel, k, inputs, output, window)
    }

    /// Posts a message to the host, as a validating script does at the end.
    pub fn send_to_client(&self, id: i32) {
        self.waiter.post(ValidationMessage::new(id));
    }
}
