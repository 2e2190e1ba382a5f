pub mod future;
pub mod local;
pub mod sync;

use crate::{
    config::{ClientConfig, ConfigErrors},
    kernels::{panic_message, KernelError},
    record::Payload,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;

pub use future::TaskFuture;
pub use local::LocalClient;
pub use sync::SyncClient;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),
}

/// What a task produces once it ran
pub type Outcome = Result<Payload, KernelError>;

/// Unit of work handed to a client, usually `Kernel::run`
pub type Task = Arc<dyn Fn(Payload) -> Outcome + Send + Sync>;

/// Argument of a task, possibly still being computed
#[derive(Debug, Clone)]
pub enum Input<F> {
    Ready(Payload),
    Pending(F),
    /// results of several futures, flattened into one list in order
    Collect(Vec<F>),
}

/// The scheduling primitives a pipeline needs
///
/// `submit` and `map` never block, they hand back futures that later tasks can depend on.
/// Only `result` and `gather` wait.
pub trait Client {
    type Future: Clone + Send + 'static;

    fn submit(&self, task: Task, input: Input<Self::Future>) -> Self::Future;

    fn map(&self, task: Task, inputs: Vec<Input<Self::Future>>) -> Vec<Self::Future> {
        inputs
            .into_iter()
            .map(|input| self.submit(task.clone(), input))
            .collect()
    }

    /// block until `future` is resolved
    fn result(&self, future: &Self::Future) -> Outcome;

    /// block until all `futures` are resolved, keeping their order
    fn gather(&self, futures: &[Self::Future]) -> Result<Vec<Payload>, KernelError> {
        futures.iter().map(|future| self.result(future)).collect()
    }
}

/// Run `task` on an already resolved input, a panic becomes an error
pub(crate) fn run_task(task: &Task, input: Outcome) -> Outcome {
    let payload = input?;

    panic::catch_unwind(AssertUnwindSafe(|| task(payload)))
        .unwrap_or_else(|payload| Err(KernelError::TaskPanicked(panic_message(payload))))
}

/// Client selected by the pipeline configuration
#[derive(Debug, Clone)]
pub enum Clients {
    Local(LocalClient),
    Sync(SyncClient),
}

impl Clients {
    pub fn load(config: &ClientConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "local" => Ok(Self::Local(LocalClient::load(config)?)),
            "sync" => Ok(Self::Sync(SyncClient::new())),
            _ => Err(ConfigErrors::UnsupportedClient(config.name.clone())),
        }
    }
}

impl Client for Clients {
    type Future = TaskFuture;

    fn submit(&self, task: Task, input: Input<TaskFuture>) -> TaskFuture {
        match self {
            Self::Local(client) => client.submit(task, input),
            Self::Sync(client) => client.submit(task, input),
        }
    }

    fn result(&self, future: &TaskFuture) -> Outcome {
        match self {
            Self::Local(client) => client.result(future),
            Self::Sync(client) => client.result(future),
        }
    }
}
