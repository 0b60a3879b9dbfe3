//! A typed, concurrent, multi-step processing pipeline.
//!
//! Each step runs in its own task and talks to the next one over a bounded queue.
//! Within a step, items are processed concurrently up to the configured parallelism and
//! are, by default, emitted in the order they came in.
//!
//! A step that panics faults: it stops processing and drops whatever is still queued for
//! it, and the steps after it report the same fault once they have drained. The fault
//! is surfaced by [`Pipeline::get_any_step_fault`], by
//! [`Pipeline::await_completion`] and by the optional health check.

mod block;
mod engine;
mod error;
mod health;
mod options;
mod step;

pub use engine::Pipeline;
pub use error::{PipelineError, StepFault};
pub use options::{PipelineOptions, StepOptions, DEFAULT_BUFFER_SIZE};
pub use step::PipelineStep;
