//! Pipelines of interface and execution kernels.
//!
//! Execution kernels run a command or a function on a [`Record`]. Interface kernels
//! rewire records between them: link one record to the next, scatter one record into
//! parallel branches, or gather branches back into one. A [`Pipeline`] chains kernels and
//! hands the actual work to a [`Client`](clients::Client).
//!
//! Failures never abort a run. A record with a non-zero `returncode` passes every later
//! kernel untouched, so errors surface in the final output.

pub mod clients;
pub mod config;
pub mod connection;
pub mod expr;
pub mod filehandle;
pub mod kernels;
pub mod pipeline;
pub mod record;
pub mod template;

pub use connection::{Connection, Operator};
pub use kernels::{Kernel, KernelError, Operation};
pub use pipeline::{Pipeline, PipelineError};
pub use record::{Payload, Record, Value};
