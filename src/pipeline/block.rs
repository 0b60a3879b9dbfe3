//! The machinery behind a single pipeline step.
use crate::pipeline::options::ResolvedOptions;
use crate::pipeline::step::{Payload, StepFn};
use crate::pipeline::StepFault;
use futures_util::{stream, StreamExt};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::{error, trace};

/// Fault and completion state of a step, shared between its worker, the pipeline and
/// the health check.
#[derive(Debug)]
pub(crate) struct BlockState {
    step: usize,
    fault: OnceLock<StepFault>,
    completed: watch::Sender<bool>,
}

impl BlockState {
    pub(crate) fn new(step: usize) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            step,
            fault: OnceLock::new(),
            completed,
        }
    }

    pub(crate) fn fault(&self) -> Option<&StepFault> {
        self.fault.get()
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.fault.get().is_some()
    }

    /// Record a fault. The first one sticks.
    pub(crate) fn set_fault(&self, fault: StepFault) {
        let message = fault.to_string();
        if self.fault.set(fault).is_ok() {
            error!(step = self.step, error = %message, "Pipeline step faulted");
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    fn complete(&self) {
        self.completed.send_replace(true);
    }

    pub(crate) async fn wait_for_completion(&self) {
        let mut completed = self.completed.subscribe();
        loop {
            if *completed.borrow_and_update() {
                return;
            }
            // The sender lives as long as `self`, so this cannot fail while we wait.
            if completed.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A step ready to run: its function, its queues and the state it reports into.
pub(crate) struct Block {
    pub(crate) func: StepFn,
    pub(crate) options: ResolvedOptions,
    pub(crate) state: Arc<BlockState>,
    pub(crate) input: mpsc::Receiver<Payload>,
    pub(crate) output: Option<mpsc::Sender<Payload>>,
    pub(crate) upstream: Option<Arc<BlockState>>,
}

impl Block {
    /// Process items until the input closes.
    ///
    /// Each item runs in its own task, at most `parallelism` at a time. Once the step has
    /// faulted the rest of its input is drained and dropped, so upstream steps never block
    /// on it. A fault from upstream is adopted when the input closes.
    pub(crate) async fn run(self) {
        let Block {
            func,
            options,
            state,
            input,
            output,
            upstream,
        } = self;
        let step = state.step;

        let items = stream::unfold(input, |mut input| async move {
            input.recv().await.map(|item| (item, input))
        });
        let work = items.map({
            let state = Arc::clone(&state);
            move |item| {
                let func = Arc::clone(&func);
                let state = Arc::clone(&state);
                async move {
                    if state.is_faulted() {
                        return None;
                    }
                    Some(tokio::spawn(func(item)).await)
                }
            }
        });
        let mut results = if options.ordered {
            work.buffered(options.parallelism).boxed()
        } else {
            work.buffer_unordered(options.parallelism).boxed()
        };

        while let Some(result) = results.next().await {
            let item = match result {
                None => continue,
                Some(Ok(Ok(item))) => item,
                Some(Ok(Err(fault))) => {
                    state.set_fault(fault);
                    continue;
                }
                Some(Err(e)) => {
                    state.set_fault(StepFault::from_join_error(step, e));
                    continue;
                }
            };
            if let Some(output) = &output {
                if output.send(item).await.is_err() {
                    trace!(step, "Next step is gone, dropping output");
                }
            }
        }

        if let Some(fault) = upstream.as_ref().and_then(|upstream| upstream.fault()) {
            state.set_fault(fault.clone());
        }
        drop(output);
        state.complete();
        trace!(step, "Pipeline step completed");
    }
}
