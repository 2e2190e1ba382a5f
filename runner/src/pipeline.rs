use crate::{
    clients::{Client, Input, Task},
    kernels::{Kernel, KernelError, Operation},
    record::{Payload, Record, OUTPUT},
};
use std::{
    io::{self, Write},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("Failed to write dry run report: {0}")]
    Io(#[from] io::Error),
}

/// Intermediate value between two kernels
enum Stage<F> {
    Value(Payload),
    One(F),
    Many(Vec<F>),
}

/// Kernels run one after the other, scheduled through a client
///
/// The pipeline itself only wires futures together. Lists are mapped element by element,
/// gather kernels get the whole list as one argument.
pub struct Pipeline<C> {
    client: C,
    kernels: Vec<Arc<Kernel>>,
}

impl<C: Client> Pipeline<C> {
    pub fn new(client: C, kernels: Vec<Kernel>) -> Self {
        Self {
            client,
            kernels: kernels.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn kernels(&self) -> &[Arc<Kernel>] {
        &self.kernels
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    #[instrument(skip_all, level = "info", fields(kernels = self.kernels.len()))]
    pub fn run(&self, input: impl Into<Payload>) -> Result<Payload, PipelineError> {
        let mut stage = Stage::Value(input.into());

        for (index, kernel) in self.kernels.iter().enumerate() {
            let task = task(kernel);
            debug!(index, kernel = %kernel.name(), "Scheduling kernel");

            stage = match (stage, kernel.operation()) {
                // gather kernels always see the whole list at once
                (Stage::Many(futures), Operation::Gather) => {
                    Stage::One(self.client.submit(task, Input::Collect(futures)))
                }
                (Stage::Value(payload), Operation::Gather) => {
                    Stage::One(self.client.submit(task, Input::Ready(payload)))
                }
                (Stage::Value(Payload::Many(records)), _) => Stage::Many(
                    self.client.map(
                        task,
                        records
                            .into_iter()
                            .map(|record| Input::Ready(record.into()))
                            .collect(),
                    ),
                ),
                (Stage::Many(futures), _) => Stage::Many(
                    self.client
                        .map(task, futures.into_iter().map(Input::Pending).collect()),
                ),
                // the number of branches depends on the data, so a scatter is resolved
                (Stage::Value(payload), Operation::Scatter) => {
                    let future = self.client.submit(task, Input::Ready(payload));
                    Stage::Value(self.client.result(&future)?)
                }
                (Stage::One(previous), Operation::Scatter) => {
                    let future = self.client.submit(task, Input::Pending(previous));
                    Stage::Value(self.client.result(&future)?)
                }
                (Stage::Value(payload), _) => {
                    Stage::One(self.client.submit(task, Input::Ready(payload)))
                }
                (Stage::One(previous), _) => {
                    Stage::One(self.client.submit(task, Input::Pending(previous)))
                }
            };
        }

        let output = match stage {
            Stage::Value(payload) => payload,
            Stage::One(future) => self.client.result(&future)?,
            Stage::Many(futures) => Payload::collect(self.client.gather(&futures)?),
        };

        let failed = output.failed().count();
        info!(
            records = output.records().len(),
            failed, "Pipeline finished"
        );

        Ok(output)
    }

    /// Run the kernel chain on the calling thread without executing anything
    ///
    /// Every command that would run is written to `out`, failing records as
    /// `Error: <output>`.
    pub fn dryrun<W: Write>(
        &self,
        input: impl Into<Payload>,
        out: &mut W,
    ) -> Result<Payload, PipelineError> {
        let mut current = input.into();
        let mut number = 0;

        for kernel in &self.kernels {
            current = match (kernel.operation(), current) {
                (Operation::Compute, input) => {
                    writeln!(out, "===== Kernel {number} =====")?;
                    number += 1;

                    let output = kernel.dryrun(input)?;
                    match &output {
                        Payload::Single(record) => {
                            if let Some(cmd) = record.cmd() {
                                writeln!(out, "{cmd}")?;
                            }
                            if record.is_failed() {
                                writeln!(out, "Error: {}", failure(record))?;
                            }
                        }
                        Payload::Many(records) => {
                            for record in records {
                                if record.is_failed() {
                                    writeln!(out, "Error: {}", failure(record))?;
                                } else {
                                    writeln!(out, "{}", record.cmd().unwrap_or_default())?;
                                }
                                writeln!(out, "--------------")?;
                            }
                        }
                    }

                    output
                }
                (Operation::Gather, input) => kernel.dryrun(input)?,
                (_, Payload::Many(records)) => Payload::collect(
                    records
                        .into_iter()
                        .map(|record| kernel.dryrun(record.into()))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                (_, input) => kernel.dryrun(input)?,
            };
        }

        writeln!(out, "======================")?;

        Ok(current)
    }
}

fn task(kernel: &Arc<Kernel>) -> Task {
    let kernel = kernel.clone();
    Arc::new(move |payload: Payload| kernel.run(payload))
}

fn failure(record: &Record) -> String {
    record
        .get(OUTPUT)
        .map(ToString::to_string)
        .unwrap_or_default()
}
