pub mod dummy;
pub mod function;
pub mod interface;
pub mod subprocess;


use crate::{connection::ConnectionError, record::Payload, template::TemplateError};
use std::any::Any;
use thiserror::Error;
use tracing::{debug, instrument};

pub use dummy::DummyKernel;
pub use function::{FunctionKernel, FunctionRegistry};
pub use interface::InterfaceKernel;
pub use subprocess::{SubprocessKernel, WorkDir};

/// Structural errors of kernels. Data errors never show up here, they are recorded in
/// the `returncode`/`output` of the affected record instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Inconsistent widths in scatter interface: '{key}' has {found} values, expected {expected}")]
    WidthMismatch {
        key: String,
        expected: usize,
        found: usize,
    },
    #[error("A scatter kernel takes a single record, got a list of {0}")]
    ScatterOverList(usize),
    #[error("Invalid connection: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Invalid command template: {0}")]
    Template(#[from] TemplateError),
    #[error("Invalid output pattern '{pattern}': {message}")]
    OutputPattern { pattern: String, message: String },
    #[error("No function named '{0}' is registered")]
    UnknownFunction(String),
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
    #[error("A failing dummy kernel needs a non-zero returncode")]
    ZeroFailure,
}

/// How a kernel shapes the data flowing through it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// one record in, one record out
    Link,
    /// one record in, many out
    Scatter,
    /// many records in, one out
    Gather,
    /// an execution kernel, applied per record
    Compute,
}

#[derive(Debug, Clone)]
pub enum Kernel {
    Interface(InterfaceKernel),
    Subprocess(SubprocessKernel),
    Function(FunctionKernel),
    Dummy(DummyKernel),
}

impl Kernel {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Interface(kernel) => kernel.operation(),
            Self::Subprocess(_) | Self::Function(_) | Self::Dummy(_) => Operation::Compute,
        }
    }

    /// short name for logs
    pub fn name(&self) -> String {
        match self {
            Self::Interface(kernel) => format!("interface:{:?}", kernel.operation()).to_lowercase(),
            Self::Subprocess(kernel) => match kernel.template() {
                Some(template) => format!("subprocess:{template}"),
                None => "subprocess".to_string(),
            },
            Self::Function(kernel) => format!("function:{}", kernel.name()),
            Self::Dummy(_) => "dummy".to_string(),
        }
    }

    #[instrument(skip_all, level = "debug", fields(kernel = %self.name()))]
    pub fn run(&self, input: Payload) -> Result<Payload, KernelError> {
        self.execute(input, false)
    }

    /// Same as [`Kernel::run`], but execution kernels only build their command
    #[instrument(skip_all, level = "debug", fields(kernel = %self.name()))]
    pub fn dryrun(&self, input: Payload) -> Result<Payload, KernelError> {
        self.execute(input, true)
    }

    fn execute(&self, input: Payload, dryrun: bool) -> Result<Payload, KernelError> {
        debug!(records = input.records().len(), dryrun, "Running kernel");

        match self {
            Self::Interface(kernel) => kernel.run(input),
            Self::Subprocess(kernel) => Ok(input.map(|record| kernel.run(record, dryrun))),
            Self::Function(kernel) => Ok(input.map(|record| kernel.run(record, dryrun))),
            Self::Dummy(kernel) => Ok(input.map(|record| kernel.run(record, dryrun))),
        }
    }
}

impl From<InterfaceKernel> for Kernel {
    fn from(kernel: InterfaceKernel) -> Self {
        Self::Interface(kernel)
    }
}

impl From<SubprocessKernel> for Kernel {
    fn from(kernel: SubprocessKernel) -> Self {
        Self::Subprocess(kernel)
    }
}

impl From<FunctionKernel> for Kernel {
    fn from(kernel: FunctionKernel) -> Self {
        Self::Function(kernel)
    }
}

impl From<DummyKernel> for Kernel {
    fn from(kernel: DummyKernel) -> Self {
        Self::Dummy(kernel)
    }
}

/// text carried by a caught panic
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}
