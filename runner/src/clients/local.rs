use super::{run_task, Client, ClientError, Input, Outcome, Task, TaskFuture};
use crate::config::ClientConfig;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info};

/// Client that works on a local thread pool
///
/// A task is only spawned once its input is resolved, so pool threads never block.
#[derive(Debug, Clone)]
pub struct LocalClient {
    pool: Arc<ThreadPool>,
    // general counters to provide progress
    submitted: Arc<AtomicU64>,
    finished: Arc<AtomicU64>,
}

impl LocalClient {
    pub fn new(threads: usize) -> Result<Self, ClientError> {
        debug!("Starting thread pool with {threads} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("xflow-worker-{index}"))
            .build()
            .map_err(|error| ClientError::ThreadPool(error.to_string()))?;

        Ok(Self {
            pool: Arc::new(pool),
            submitted: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicU64::new(0)),
        })
    }

    /// create a client from `client.parameter.threads`, defaulting to the number of cpus
    pub fn load(config: &ClientConfig) -> Result<Self, ClientError> {
        let threads = if let Some(Some(Some(Ok(number)))) =
            config.parameter.as_ref().map(|parameters| {
                parameters
                    .get("threads")
                    .map(|value| value.as_u64().map(usize::try_from))
            }) {
            number
        } else {
            num_cpus::get()
        };

        Self::new(threads)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Client for LocalClient {
    type Future = TaskFuture;

    fn submit(&self, task: Task, input: Input<TaskFuture>) -> TaskFuture {
        let future = TaskFuture::pending();
        let resolver = future.clone();
        let pool = self.pool.clone();
        let submitted = self.submitted.clone();
        let finished = self.finished.clone();

        submitted.fetch_add(1, Ordering::SeqCst);

        input.when_ready(move |input| {
            pool.spawn(move || {
                resolver.resolve(run_task(&task, input));

                info!(
                    "Done with {}/{}",
                    finished.fetch_add(1, Ordering::SeqCst) + 1,
                    submitted.load(Ordering::SeqCst)
                );
            });
        });

        future
    }

    fn result(&self, future: &TaskFuture) -> Outcome {
        future.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kernels::KernelError, record, record::Payload};
    use std::collections::BTreeMap;

    fn increment() -> Task {
        Arc::new(|payload: Payload| -> Outcome {
            Ok(payload.map(|mut record| {
                let next = record.get("i").and_then(|value| value.as_int()).unwrap_or(0) + 1;
                record.insert("i", next);
                record
            }))
        })
    }

    #[test]
    fn chains_dependent_tasks() {
        let client = LocalClient::new(2).unwrap();

        let first = client.submit(increment(), Input::Ready(record! { "i" => 0 }.into()));
        let second = client.submit(increment(), Input::Pending(first));

        assert_eq!(client.result(&second), Ok(record! { "i" => 2 }.into()));
    }

    #[test]
    fn map_and_gather_keep_order() {
        let client = LocalClient::new(4).unwrap();
        let inputs = (0..16)
            .map(|i| Input::Ready(record! { "i" => i }.into()))
            .collect();

        let futures = client.map(increment(), inputs);
        let gathered = client.gather(&futures).unwrap();

        let values = gathered
            .iter()
            .flat_map(Payload::records)
            .filter_map(|record| record.get("i").and_then(|value| value.as_int()))
            .collect::<Vec<_>>();
        assert_eq!(values, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn panics_become_errors() {
        let client = LocalClient::new(1).unwrap();
        let task: Task = Arc::new(|_: Payload| -> Outcome { panic!("worker exploded") });

        let future = client.submit(task, Input::Ready(Payload::default()));
        assert_eq!(
            client.result(&future),
            Err(KernelError::TaskPanicked("worker exploded".to_string()))
        );
    }

    #[test]
    fn threads_from_config() {
        let mut parameter = BTreeMap::new();
        parameter.insert("threads".to_string(), serde_yaml::from_str("3").unwrap());
        let config = ClientConfig {
            name: "local".to_string(),
            parameter: Some(parameter),
        };

        assert_eq!(LocalClient::load(&config).unwrap().threads(), 3);
    }
}
