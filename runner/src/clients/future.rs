use super::{Input, Outcome};
use crate::record::Payload;
use parking_lot::{Condvar, Mutex};
use std::{fmt, sync::Arc};
use tracing::warn;
use tracing_unwrap::OptionExt;

type Callback = Box<dyn FnOnce(Outcome) + Send>;

struct State {
    outcome: Option<Outcome>,
    callbacks: Vec<Callback>,
}

struct Slot {
    state: Mutex<State>,
    ready: Condvar,
}

/// Write-once result of a submitted task
///
/// Dependent work registers a callback instead of blocking, so worker threads never wait
/// on each other.
#[derive(Clone)]
pub struct TaskFuture(Arc<Slot>);

impl TaskFuture {
    pub fn pending() -> Self {
        Self(Arc::new(Slot {
            state: Mutex::new(State {
                outcome: None,
                callbacks: Vec::new(),
            }),
            ready: Condvar::new(),
        }))
    }

    pub fn ready(outcome: Outcome) -> Self {
        let future = Self::pending();
        future.resolve(outcome);
        future
    }

    /// Set the result and run everything waiting on it, later calls are ignored
    pub fn resolve(&self, outcome: Outcome) {
        let callbacks = {
            let mut state = self.0.state.lock();
            if state.outcome.is_some() {
                warn!("Future resolved twice, keeping the first result");
                return;
            }

            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.0.ready.notify_all();

        for callback in callbacks {
            callback(outcome.clone());
        }
    }

    pub fn is_ready(&self) -> bool {
        self.0.state.lock().outcome.is_some()
    }

    /// Block the calling thread until the future is resolved
    pub fn wait(&self) -> Outcome {
        let mut state = self.0.state.lock();

        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.0.ready.wait(&mut state);
        }
    }

    /// Run `callback` once resolved, immediately if that already happened
    pub fn on_ready(&self, callback: impl FnOnce(Outcome) + Send + 'static) {
        let outcome = {
            let mut state = self.0.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };

        callback(outcome);
    }

    /// Run `callback` with all results, in the order of `futures`, once all are resolved
    pub fn when_all(futures: &[TaskFuture], callback: impl FnOnce(Vec<Outcome>) + Send + 'static) {
        if futures.is_empty() {
            callback(Vec::new());
            return;
        }

        struct Join {
            outcomes: Vec<Option<Outcome>>,
            remaining: usize,
            callback: Option<Box<dyn FnOnce(Vec<Outcome>) + Send>>,
        }

        let join = Arc::new(Mutex::new(Join {
            outcomes: vec![None; futures.len()],
            remaining: futures.len(),
            callback: Some(Box::new(callback)),
        }));

        for (index, future) in futures.iter().enumerate() {
            let join = join.clone();

            future.on_ready(move |outcome| {
                let finished = {
                    let mut join = join.lock();
                    join.outcomes[index] = Some(outcome);
                    join.remaining -= 1;

                    if join.remaining == 0 {
                        let outcomes = std::mem::take(&mut join.outcomes)
                            .into_iter()
                            .map(|outcome| outcome.expect_or_log("every future reported back"))
                            .collect::<Vec<_>>();
                        join.callback.take().map(|callback| (callback, outcomes))
                    } else {
                        None
                    }
                };

                if let Some((callback, outcomes)) = finished {
                    callback(outcomes);
                }
            });
        }
    }
}

impl fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Input<TaskFuture> {
    /// Call `callback` with the input once every future it depends on is resolved
    pub fn when_ready(self, callback: impl FnOnce(Outcome) + Send + 'static) {
        match self {
            Self::Ready(payload) => callback(Ok(payload)),
            Self::Pending(future) => future.on_ready(callback),
            Self::Collect(futures) => TaskFuture::when_all(&futures, move |outcomes| {
                callback(
                    outcomes
                        .into_iter()
                        .collect::<Result<Vec<_>, _>>()
                        .map(Payload::collect),
                )
            }),
        }
    }

    /// Block until the input is available
    pub fn wait(self) -> Outcome {
        match self {
            Self::Ready(payload) => Ok(payload),
            Self::Pending(future) => future.wait(),
            Self::Collect(futures) => futures
                .iter()
                .map(TaskFuture::wait)
                .collect::<Result<Vec<_>, _>>()
                .map(Payload::collect),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn wait_returns_once_resolved() {
        let future = TaskFuture::pending();
        let resolver = future.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(Ok(record! { "x" => 1 }.into()));
        });

        assert_eq!(future.wait(), Ok(record! { "x" => 1 }.into()));
        handle.join().unwrap();
    }

    #[test]
    fn callbacks_run_before_and_after_resolution() {
        let (sender, receiver) = mpsc::channel();
        let future = TaskFuture::pending();

        let early = sender.clone();
        future.on_ready(move |outcome| early.send(("early", outcome)).unwrap());
        future.resolve(Ok(Payload::default()));
        future.on_ready(move |outcome| sender.send(("late", outcome)).unwrap());

        let order = receiver.iter().take(2).map(|(name, _)| name).collect::<Vec<_>>();
        assert_eq!(order, vec!["early", "late"]);
    }

    #[test]
    fn when_all_keeps_order() {
        let futures = (0..3).map(|_| TaskFuture::pending()).collect::<Vec<_>>();
        let (sender, receiver) = mpsc::channel();

        Input::Collect(futures.clone()).when_ready(move |outcome| sender.send(outcome).unwrap());

        // resolve out of order
        for index in [2, 0, 1] {
            futures[index].resolve(Ok(record! { "i" => index as i64 }.into()));
        }

        let collected = receiver.recv().unwrap().unwrap();
        assert_eq!(
            collected,
            Payload::Many(vec![
                record! { "i" => 0 },
                record! { "i" => 1 },
                record! { "i" => 2 },
            ])
        );
    }

    #[test]
    fn second_resolve_is_ignored() {
        let future = TaskFuture::ready(Ok(record! { "x" => 1 }.into()));
        future.resolve(Ok(record! { "x" => 2 }.into()));

        assert_eq!(future.wait(), Ok(record! { "x" => 1 }.into()));
    }
}
