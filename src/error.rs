use thiserror::Error;

/// Errors raised by the compute runtime.
///
/// `Clone` so that the failure which poisons a context can be handed to
/// every thread blocked in `finish` or `wait_for_message`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarnessError {
    #[error("allocation error: {0}")]
    Allocation(String),
    #[error("shape mismatch in `{kernel}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        kernel: String,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout { what: &'static str, waited_ms: u64 },
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
    #[error("script `{script}` has no entry point named `{name}`")]
    UnknownEntryPoint { script: String, name: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("kernel `{kernel}` failed: {reason}")]
    KernelFailed { kernel: String, reason: String },
    #[error("gpu error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    pub fn kernel_failed(kernel: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::KernelFailed {
            kernel: kernel.into(),
            reason: reason.to_string(),
        }
    }
}
