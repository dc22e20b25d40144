//! Host-side harness for dispatching typed-buffer compute kernels.
//!
//! A [`ComputeContext`] owns a FIFO work queue served by one worker thread.
//! Scripts bundle named elementwise kernels and scalar invokables; the host
//! queues `invoke` and `for_each` calls, then blocks in `finish` and
//! `wait_for_message` until the script reports its verdict.

pub mod allocation;
pub mod config;
pub mod context;
pub mod element;
pub mod error;
pub mod foreach;
pub mod gpu;
pub mod lifecycle;
pub mod script;
pub mod shaders;
pub mod signal;
pub mod suite;

pub use allocation::{Allocation, Type};
pub use config::HarnessConfig;
pub use context::{ComputeContext, ScriptHandle};
pub use element::{Element, ElementKind};
pub use error::{HarnessError, Result};
pub use foreach::LaunchOptions;
pub use lifecycle::{ContextLifecycle, LifecycleState};
pub use script::{Kernel, Script, ScriptBuilder, ScriptEnv, Value};
pub use signal::{MessageStatus, ValidationMessage, RS_MSG_TEST_FAILED, RS_MSG_TEST_PASSED};
pub use unit_test::{TestCore, TestOutcome, TestReport, UnitTest};
