use super::{KernelError, Operation};
use crate::{
    connection::{Connection, ConnectionError, Operator, RuleError},
    record::{Payload, Record, Value, CMD, TEMPLATE},
    template::Template,
};
use tracing::{debug, trace};

/// Rewires records between execution kernels
///
/// Connections are applied in order to a working copy of the input, so every connection
/// sees what the ones before it produced. The kernel never fails on bad data: the
/// affected record gets `returncode = 1` and the error message as `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceKernel {
    connections: Vec<Connection>,
    operation: Operation,
}

impl InterfaceKernel {
    pub fn new(connections: Vec<Connection>) -> Result<Self, ConnectionError> {
        let scatters = connections.iter().any(|c| c.operator().is_scatter());
        let gathers = connections.iter().any(|c| c.operator().is_gather());

        let operation = match (scatters, gathers) {
            (true, true) => return Err(ConnectionError::MixedOperation),
            (true, false) => Operation::Scatter,
            (false, true) => Operation::Gather,
            (false, false) => Operation::Link,
        };

        Ok(Self {
            connections,
            operation,
        })
    }

    /// Build a kernel from `"key operator definition"` lines
    pub fn parse<I, S>(lines: I) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .map(|line| line.as_ref().parse())
            .collect::<Result<Vec<Connection>, _>>()
            .and_then(Self::new)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn run(&self, input: Payload) -> Result<Payload, KernelError> {
        match self.operation {
            Operation::Scatter => match input {
                Payload::Single(record) => self.scatter(record).map(Payload::Many),
                Payload::Many(records) => Err(KernelError::ScatterOverList(records.len())),
            },
            Operation::Gather => Ok(Payload::Single(self.gather(input.into_records()))),
            Operation::Link | Operation::Compute => Ok(input.map(|record| self.link(record))),
        }
    }

    fn link(&self, record: Record) -> Record {
        if record.is_failed() {
            return record;
        }

        let mut output = record;
        let applied = self
            .connections
            .iter()
            .try_for_each(|connection| connection.apply(&mut output))
            .and_then(|()| build_cmd(&mut output));

        finish(output, applied)
    }

    /// The scatter values of every scatter connection, evaluated against the input
    fn columns(&self, record: &Record) -> Result<Vec<(&Connection, Vec<Value>)>, RuleError> {
        self.connections
            .iter()
            .filter(|connection| connection.operator().is_scatter())
            .map(|connection| Ok((connection, connection.scatter_values(record)?)))
            .collect()
    }

    fn scatter(&self, record: Record) -> Result<Vec<Record>, KernelError> {
        let columns = match self.columns(&record) {
            Ok(columns) => columns,
            // without a width there is nothing to fan out over
            Err(_) if record.is_failed() => return Ok(vec![record]),
            Err(error) => {
                debug!(error = %error, "Failed to compute scatter width");
                let mut output = record;
                output.fail(1, error.to_string());
                return Ok(vec![output]);
            }
        };

        let width = scatter_width(&columns)?;
        trace!(width, "Scattering record");

        if record.is_failed() {
            return Ok(vec![record; width.max(1)]);
        }

        let outputs = (0..width)
            .map(|index| {
                let mut output = record.clone();
                let mut values = columns.iter().map(|(_, values)| values);

                let applied = self
                    .connections
                    .iter()
                    .try_for_each(|connection| {
                        if connection.operator().is_scatter() {
                            let value = values.next().and_then(|values| values.get(index)).ok_or_else(
                                || RuleError::ScatterIndex {
                                    key: connection.key().to_string(),
                                    index,
                                },
                            )?;
                            output.insert(connection.key(), value.clone());
                            Ok(())
                        } else {
                            connection.apply(&mut output)
                        }
                    })
                    .and_then(|()| build_cmd(&mut output));

                finish(output, applied)
            })
            .collect();

        Ok(outputs)
    }

    fn gather(&self, inputs: Vec<Record>) -> Record {
        // a single failed branch poisons the whole gather
        if let Some(failed) = inputs.iter().find(|record| record.is_failed()) {
            return failed.clone();
        }

        let Some(base) = inputs.first() else {
            let mut output = Record::new();
            output.fail(1, "gather received no records");
            return output;
        };

        let mut output = base.clone();
        let combined = self.combine(&mut output, &inputs[1..]);

        finish(output, combined)
    }

    fn combine(&self, output: &mut Record, rest: &[Record]) -> Result<(), RuleError> {
        for connection in &self.connections {
            match connection.operator() {
                Operator::Gather => {
                    let value = connection.render(output)?;
                    output.insert(connection.key(), value);
                }
                Operator::Append => {
                    let value = connection.render(output)?;
                    let items = appended(output.remove(connection.key()), value);
                    output.insert(connection.key(), items);
                }
                _ => connection.apply(output)?,
            }
        }

        for input in rest {
            for connection in &self.connections {
                let value = match connection.operator() {
                    Operator::Gather | Operator::Append => connection.render(input)?,
                    _ => continue,
                };

                let existing = output.remove(connection.key());
                match connection.operator() {
                    Operator::Append => {
                        output.insert(connection.key(), appended(existing, value));
                    }
                    _ => {
                        let joined = match existing {
                            Some(existing) => format!("{existing} {value}"),
                            None => value,
                        };
                        output.insert(connection.key(), joined);
                    }
                }
            }
        }

        build_cmd(output)
    }
}

fn scatter_width(columns: &[(&Connection, Vec<Value>)]) -> Result<usize, KernelError> {
    let Some(((_, first), rest)) = columns.split_first() else {
        return Ok(0);
    };

    for (connection, values) in rest {
        if values.len() != first.len() {
            return Err(KernelError::WidthMismatch {
                key: connection.key().to_string(),
                expected: first.len(),
                found: values.len(),
            });
        }
    }

    Ok(first.len())
}

fn appended(existing: Option<Value>, value: String) -> Vec<String> {
    let mut items = match existing {
        Some(Value::List(items)) => items,
        Some(other) => other.items().unwrap_or_else(|| vec![other.to_string()]),
        None => Vec::new(),
    };
    items.push(value);

    items
}

/// render `template` into `cmd` once all connections are applied
fn build_cmd(record: &mut Record) -> Result<(), RuleError> {
    let Some(source) = record.get(TEMPLATE).and_then(Value::as_str) else {
        return Ok(());
    };

    let cmd = Template::parse(source)?.render(record)?;
    record.insert(CMD, cmd);

    Ok(())
}

fn finish(mut output: Record, result: Result<(), RuleError>) -> Record {
    match result {
        Ok(()) => output.succeed(),
        Err(error) => {
            debug!(error = %error, "Interface failed for record");
            output.fail(1, error.to_string());
        }
    }

    output
}
