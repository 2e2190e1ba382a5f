use super::{run_task, Client, Input, Outcome, Task, TaskFuture};

/// Client that runs every task right away on the calling thread
///
/// Futures it returns are always resolved. Meant for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct SyncClient;

impl SyncClient {
    pub fn new() -> Self {
        Self
    }
}

impl Client for SyncClient {
    type Future = TaskFuture;

    fn submit(&self, task: Task, input: Input<TaskFuture>) -> TaskFuture {
        TaskFuture::ready(run_task(&task, input.wait()))
    }

    fn result(&self, future: &TaskFuture) -> Outcome {
        future.wait()
    }
}
