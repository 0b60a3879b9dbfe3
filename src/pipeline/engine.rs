use crate::pipeline::block::{Block, BlockState};
use crate::pipeline::health::{self, FaultRegistry};
use crate::pipeline::options::{PipelineOptions, ResolvedOptions, StepOptions};
use crate::pipeline::step::{async_step, sync_step, Payload, PipelineStep, StepFn, TypeTag};
use crate::pipeline::{PipelineError, StepFault};
use parking_lot::Mutex;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const DEFAULT_NAME: &str = "pipeline";

/// A chain of processing steps taking `TIn` in and handing `TOut` to a final action.
///
/// Steps are added with [`add_step`](Self::add_step) and
/// [`add_async_step`](Self::add_async_step); each one must accept what the previous one
/// returns, which is checked as soon as the step is added. Once the chain is
/// [finalized](Self::finalize) every step runs as its own task, with bounded queues in
/// between: a slow step suspends the producers upstream of it instead of buffering
/// without limit.
///
/// ```rust
/// use burrow::pipeline::{Pipeline, StepOptions};
///
/// # async fn run() -> Result<(), burrow::pipeline::PipelineError> {
/// let mut pipeline = Pipeline::<u32, String>::new(4);
/// pipeline
///     .add_step(|x: u32| x * 2)?
///     .add_async_step_with(
///         |x: u32| async move { format!("#{x}") },
///         StepOptions::default().parallelism(8),
///     )?;
/// pipeline.finalize(|label: String| println!("{label}"))?;
///
/// for i in 0..10 {
///     pipeline.queue_for_execution(i).await?;
/// }
/// pipeline.await_completion().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<TIn, TOut> {
    name: String,
    options: PipelineOptions,
    steps: Vec<PipelineStep>,
    pending: Vec<PendingStep>,
    ready: bool,
    input: Mutex<Option<mpsc::Sender<Payload>>>,
    faults: FaultRegistry,
    shutdown: CancellationToken,
    health_check: Option<JoinHandle<()>>,
    _types: PhantomData<fn(TIn) -> TOut>,
}

struct PendingStep {
    func: StepFn,
    output: TypeTag,
    options: ResolvedOptions,
}

impl<TIn, TOut> Pipeline<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Send + 'static,
{
    /// A pipeline whose steps process up to `max_parallelism` items each.
    pub fn new(max_parallelism: usize) -> Self {
        Self::with_options(PipelineOptions {
            max_parallelism,
            ..PipelineOptions::default()
        })
    }

    pub fn with_options(options: PipelineOptions) -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            options,
            steps: Vec::new(),
            pending: Vec::new(),
            ready: false,
            input: Mutex::new(None),
            faults: FaultRegistry::default(),
            shutdown: CancellationToken::new(),
            health_check: None,
            _types: PhantomData,
        }
    }

    /// A named pipeline that logs its health every `interval`.
    ///
    /// The health check stops when the pipeline completes or is dropped. It is spawned
    /// right away, so this must be called from within a Tokio runtime.
    pub fn with_health_check(
        options: PipelineOptions,
        name: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let mut pipeline = Self::with_options(options);
        pipeline.name = name.into();
        pipeline.health_check = Some(runtime.spawn(health::health_check(
            pipeline.name.clone(),
            interval,
            Arc::clone(&pipeline.faults),
            pipeline.shutdown.clone(),
        )));
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// `true` once the pipeline has been finalized and accepts work.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// `true` while the health check task is alive.
    pub fn is_health_check_running(&self) -> bool {
        self.health_check
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    pub fn add_step<I, O, F>(&mut self, step: F) -> Result<&mut Self, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        self.add_step_with(step, StepOptions::default())
    }

    pub fn add_step_with<I, O, F>(
        &mut self,
        step: F,
        options: StepOptions,
    ) -> Result<&mut Self, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let index = self.steps.len();
        self.push_step(
            sync_step(index, step),
            false,
            TypeTag::of::<I>(),
            TypeTag::of::<O>(),
            options,
        )
    }

    pub fn add_async_step<I, O, F, Fut>(&mut self, step: F) -> Result<&mut Self, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        self.add_async_step_with(step, StepOptions::default())
    }

    pub fn add_async_step_with<I, O, F, Fut>(
        &mut self,
        step: F,
        options: StepOptions,
    ) -> Result<&mut Self, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let index = self.steps.len();
        self.push_step(
            async_step(index, step),
            true,
            TypeTag::of::<I>(),
            TypeTag::of::<O>(),
            options,
        )
    }

    /// Append several steps that all map a `T` to a `T`, sharing the same options.
    pub fn add_steps<T, F>(
        &mut self,
        steps: impl IntoIterator<Item = F>,
        options: StepOptions,
    ) -> Result<&mut Self, PipelineError>
    where
        T: Send + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        for step in steps {
            self.add_step_with(step, options)?;
        }
        Ok(self)
    }

    /// Async counterpart of [`add_steps`](Self::add_steps).
    pub fn add_async_steps<T, F, Fut>(
        &mut self,
        steps: impl IntoIterator<Item = F>,
        options: StepOptions,
    ) -> Result<&mut Self, PipelineError>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        for step in steps {
            self.add_async_step_with(step, options)?;
        }
        Ok(self)
    }

    /// Append `action` as the final step and start the pipeline.
    ///
    /// The action runs with the pipeline's default options, so with a parallelism above
    /// 1 its calls can overlap. Use [`finalize_with`](Self::finalize_with) to pin it.
    pub fn finalize<F>(&mut self, action: F) -> Result<(), PipelineError>
    where
        F: Fn(TOut) + Send + Sync + 'static,
    {
        self.finalize_with(action, StepOptions::default())
    }

    /// Append `action` as the final step, with its own options, and start the pipeline.
    pub fn finalize_with<F>(&mut self, action: F, options: StepOptions) -> Result<(), PipelineError>
    where
        F: Fn(TOut) + Send + Sync + 'static,
    {
        let runtime = self.check_finalizable()?;
        let index = self.steps.len();
        self.push_step(
            sync_step(index, action),
            false,
            TypeTag::of::<TOut>(),
            TypeTag::of::<()>(),
            options,
        )?;
        self.start(runtime);
        Ok(())
    }

    /// Append the async `action` as the final step and start the pipeline.
    pub fn finalize_async<F, Fut>(&mut self, action: F) -> Result<(), PipelineError>
    where
        F: Fn(TOut) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.finalize_async_with(action, StepOptions::default())
    }

    pub fn finalize_async_with<F, Fut>(
        &mut self,
        action: F,
        options: StepOptions,
    ) -> Result<(), PipelineError>
    where
        F: Fn(TOut) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.check_finalizable()?;
        let index = self.steps.len();
        self.push_step(
            async_step(index, action),
            true,
            TypeTag::of::<TOut>(),
            TypeTag::of::<()>(),
            options,
        )?;
        self.start(runtime);
        Ok(())
    }

    /// Start the pipeline as is, the last step added becoming the final one.
    ///
    /// That step must return `TOut`; its outputs are dropped.
    pub fn finalize_without_action(&mut self) -> Result<(), PipelineError> {
        let runtime = self.check_finalizable()?;
        let last = self.pending.len() - 1;
        let produced = self.pending[last].output;
        let wanted = TypeTag::of::<TOut>();
        if produced.id != wanted.id {
            return Err(PipelineError::StepTypeMismatch {
                step: last,
                expected: wanted.name,
                found: produced.name,
            });
        }
        self.start(runtime);
        Ok(())
    }

    /// Hand an item to the first step.
    ///
    /// Waits while the first step's buffer is full.
    pub async fn queue_for_execution(&self, input: TIn) -> Result<(), PipelineError> {
        if !self.ready {
            return Err(PipelineError::NotFinalized);
        }
        let sender = self.input.lock().clone().ok_or(PipelineError::Rejected)?;
        if self.steps[0].is_faulted() {
            return Err(PipelineError::Rejected);
        }
        sender
            .send(Box::new(input))
            .await
            .map_err(|_| PipelineError::Rejected)?;
        trace!(pipeline = %self.name, "Queued item for execution");
        Ok(())
    }

    /// Stop accepting work and wait for every queued item to go through.
    ///
    /// Returns the fault of the first faulted step, if any.
    pub async fn await_completion(&self) -> Result<(), PipelineError> {
        if !self.ready {
            return Err(PipelineError::NotFinalized);
        }
        drop(self.input.lock().take());
        trace!(pipeline = %self.name, "Awaiting pipeline completion");

        if let Some(last) = self.steps.last() {
            last.state.wait_for_completion().await;
        }
        self.shutdown.cancel();
        debug!(pipeline = %self.name, "Pipeline completed");

        match self.get_any_step_fault() {
            Some(fault) => Err(PipelineError::Faulted(fault)),
            None => Ok(()),
        }
    }

    /// The fault of the earliest step that faulted, if any.
    pub fn get_any_step_fault(&self) -> Option<StepFault> {
        self.steps.iter().find_map(PipelineStep::fault)
    }

    fn check_finalizable(&self) -> Result<Handle, PipelineError> {
        if self.ready {
            return Err(PipelineError::AlreadyFinalized);
        }
        if self.steps.is_empty() {
            return Err(PipelineError::NoSteps);
        }
        Handle::try_current().map_err(|_| PipelineError::NoRuntime)
    }

    fn push_step(
        &mut self,
        func: StepFn,
        is_async: bool,
        input: TypeTag,
        output: TypeTag,
        options: StepOptions,
    ) -> Result<&mut Self, PipelineError> {
        if self.ready {
            return Err(PipelineError::AlreadyFinalized);
        }
        let index = self.steps.len();
        let fed = self
            .pending
            .last()
            .map_or_else(TypeTag::of::<TIn>, |previous| previous.output);
        if fed.id != input.id {
            return Err(PipelineError::StepTypeMismatch {
                step: index,
                expected: input.name,
                found: fed.name,
            });
        }

        let options = self.options.resolve(options);
        let state = Arc::new(BlockState::new(index));
        self.faults.write().push(Arc::clone(&state));
        self.steps.push(PipelineStep {
            index,
            is_async,
            is_last: false,
            input: input.name,
            output: output.name,
            parallelism: options.parallelism,
            ordered: options.ordered,
            buffer_size: options.buffer_size,
            state,
        });
        self.pending.push(PendingStep {
            func,
            output,
            options,
        });
        trace!(pipeline = %self.name, step = index, "Added pipeline step");
        Ok(self)
    }

    fn start(&mut self, runtime: Handle) {
        let pending = std::mem::take(&mut self.pending);
        let (senders, receivers): (Vec<_>, Vec<_>) = pending
            .iter()
            .map(|step| mpsc::channel::<Payload>(step.options.buffer_size))
            .unzip();
        let mut senders = senders.into_iter();
        let first = senders.next();
        let outputs = senders.map(Some).chain(std::iter::once(None));

        let blocks = pending.into_iter().zip(receivers).zip(outputs);
        for (index, ((step, input), output)) in blocks.enumerate() {
            let upstream = index
                .checked_sub(1)
                .map(|previous| Arc::clone(&self.steps[previous].state));
            let block = Block {
                func: step.func,
                options: step.options,
                state: Arc::clone(&self.steps[index].state),
                input,
                output,
                upstream,
            };
            runtime.spawn(block.run());
        }

        if let Some(last) = self.steps.last_mut() {
            last.is_last = true;
        }
        *self.input.lock() = first;
        self.ready = true;
        debug!(pipeline = %self.name, steps = self.steps.len(), "Pipeline finalized");
    }
}

impl<TIn, TOut> Drop for Pipeline<TIn, TOut> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
