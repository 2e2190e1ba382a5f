use super::KernelError;
use crate::record::{Record, CMD};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Test double for execution kernels
///
/// Clones share the call counter, so a kernel moved into a pipeline can still be inspected.
#[derive(Debug, Clone, Default)]
pub struct DummyKernel {
    failure: Option<(i64, String)>,
    calls: Arc<AtomicUsize>,
}

impl DummyKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel that fails every record it really runs, `returncode` must be non-zero
    pub fn failing(returncode: i64, message: impl Into<String>) -> Result<Self, KernelError> {
        if returncode == 0 {
            return Err(KernelError::ZeroFailure);
        }

        Ok(Self {
            failure: Some((returncode, message.into())),
            ..Self::default()
        })
    }

    /// number of records that were not short-circuited or dry run
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn run(&self, record: Record, dryrun: bool) -> Record {
        if record.is_failed() {
            return record;
        }

        let mut output = record;
        output.insert(CMD, "dummy");
        if output.returncode().is_none() {
            output.succeed();
        }

        if dryrun {
            return output;
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some((returncode, message)) => output.fail(*returncode, message.as_str()),
            None => output.succeed(),
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn failing_needs_a_nonzero_returncode() {
        assert_eq!(
            DummyKernel::failing(0, "not really").unwrap_err(),
            KernelError::ZeroFailure
        );

        let kernel = DummyKernel::failing(5, "broken").unwrap();
        let output = kernel.run(record! { "x" => 1 }, false);
        assert!(output.is_failed());
        assert_eq!(output.returncode(), Some(5));
        assert_eq!(output.output(), Some("broken"));
        assert_eq!(kernel.calls(), 1);
    }

    #[test]
    fn dryrun_does_not_count() {
        let kernel = DummyKernel::new();
        let clone = kernel.clone();

        let output = clone.run(record! { "x" => 1 }, true);
        assert_eq!(output.returncode(), Some(0));
        assert_eq!(output.cmd(), Some("dummy"));
        assert_eq!(kernel.calls(), 0);

        clone.run(record! { "x" => 1 }, false);
        assert_eq!(kernel.calls(), 1);
    }
}
