use super::{panic_message, KernelError};
use crate::record::{Record, Value, CMD};
use std::{
    collections::BTreeMap,
    error::Error,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, instrument};

pub type FunctionError = Box<dyn Error + Send + Sync>;

/// A callable over a record, returning the keys it wants to set
pub type Function = Arc<dyn Fn(&Record) -> Result<Record, FunctionError> + Send + Sync>;

/// Runs a registered function instead of a command
#[derive(Clone)]
pub struct FunctionKernel {
    name: String,
    function: Function,
    constants: Record,
}

impl fmt::Debug for FunctionKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionKernel")
            .field("name", &self.name)
            .field("constants", &self.constants)
            .finish_non_exhaustive()
    }
}

impl FunctionKernel {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&Record) -> Result<Record, FunctionError> + Send + Sync + 'static,
    {
        Self::from_shared(name, Arc::new(function))
    }

    pub fn from_shared(name: impl Into<String>, function: Function) -> Self {
        Self {
            name: name.into(),
            function,
            constants: Record::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel scoped value, visible to the function but not added to the record
    pub fn set_constant(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.constants.insert(key, value);
    }

    #[instrument(skip_all, level = "debug", fields(function = %self.name))]
    pub fn run(&self, record: Record, dryrun: bool) -> Record {
        if record.is_failed() {
            return record;
        }

        let mut output = record;
        if output.returncode().is_none() {
            output.succeed();
        }
        output.insert(CMD, self.name.as_str());

        if dryrun {
            return output;
        }

        let mut arguments = output.clone();
        arguments.extend(self.constants.clone());

        match panic::catch_unwind(AssertUnwindSafe(|| (self.function)(&arguments))) {
            Ok(Ok(result)) => output.extend(result),
            Ok(Err(error)) => {
                debug!(error = %error, "Function failed");
                output.fail(1, error.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload);
                debug!(panic = %message, "Function panicked");
                output.fail(1, format!("Function '{}' panicked: {message}", self.name));
            }
        }

        output
    }
}

/// Named functions a pipeline definition can refer to
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Function>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&Record) -> Result<Record, FunctionError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// A kernel running the function registered as `name`
    pub fn kernel(&self, name: &str) -> Result<FunctionKernel, KernelError> {
        self.functions
            .get(name)
            .map(|function| FunctionKernel::from_shared(name, function.clone()))
            .ok_or_else(|| KernelError::UnknownFunction(name.to_string()))
    }
}
