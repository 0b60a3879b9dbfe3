use crate::pipeline::block::BlockState;
use crate::pipeline::StepFault;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::{type_name, Any, TypeId};
use std::future::Future;
use std::sync::Arc;

/// A work item travelling between two steps.
pub(crate) type Payload = Box<dyn Any + Send>;

/// Every step, sync or async, is adapted to this shape.
pub(crate) type StepFn =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, StepFault>> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct TypeTag {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
}

impl TypeTag {
    pub(crate) fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

fn downcast<I: 'static>(step: usize, payload: Payload) -> Result<I, StepFault> {
    payload
        .downcast::<I>()
        .map(|input| *input)
        .map_err(|_| StepFault::UnexpectedInput {
            step,
            expected: type_name::<I>(),
        })
}

pub(crate) fn sync_step<I, O, F>(step: usize, f: F) -> StepFn
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |payload: Payload| {
        let f = Arc::clone(&f);
        async move {
            let input = downcast::<I>(step, payload)?;
            Ok(Box::new(f(input)) as Payload)
        }
        .boxed()
    })
}

pub(crate) fn async_step<I, O, F, Fut>(step: usize, f: F) -> StepFn
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |payload: Payload| {
        let f = Arc::clone(&f);
        async move {
            let input = downcast::<I>(step, payload)?;
            Ok(Box::new(f(input).await) as Payload)
        }
        .boxed()
    })
}

/// Describes one step of a [`Pipeline`](crate::pipeline::Pipeline).
///
/// Steps are numbered from 0 in the order they were added.
#[derive(Clone, Debug)]
pub struct PipelineStep {
    pub(crate) index: usize,
    pub(crate) is_async: bool,
    pub(crate) is_last: bool,
    pub(crate) input: &'static str,
    pub(crate) output: &'static str,
    pub(crate) parallelism: usize,
    pub(crate) ordered: bool,
    pub(crate) buffer_size: usize,
    pub(crate) state: Arc<BlockState>,
}

impl PipelineStep {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// `true` for the step the pipeline waits on in
    /// [`await_completion`](crate::pipeline::Pipeline::await_completion).
    pub fn is_last_step(&self) -> bool {
        self.is_last
    }

    pub fn input_type(&self) -> &'static str {
        self.input
    }

    pub fn output_type(&self) -> &'static str {
        self.output
    }

    pub fn max_parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn fault(&self) -> Option<StepFault> {
        self.state.fault().cloned()
    }

    pub fn is_faulted(&self) -> bool {
        self.state.is_faulted()
    }

    /// `true` once the step has drained its input and will produce nothing else.
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }
}
