use tokio::task::JoinError;

/// Why a pipeline step stopped processing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StepFault {
    #[error("Step {step} panicked: {message}")]
    Panicked { step: usize, message: String },
    #[error("Step {step} received an input that is not a `{expected}`")]
    UnexpectedInput { step: usize, expected: &'static str },
    #[error("Step {step} was cancelled before it could finish")]
    Cancelled { step: usize },
}

impl StepFault {
    /// The index of the step that faulted.
    pub fn step(&self) -> usize {
        match self {
            Self::Panicked { step, .. }
            | Self::UnexpectedInput { step, .. }
            | Self::Cancelled { step } => *step,
        }
    }

    pub(crate) fn from_join_error(step: usize, error: JoinError) -> Self {
        if !error.is_panic() {
            return Self::Cancelled { step };
        }
        let panic = error.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        Self::Panicked { step, message }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("The pipeline has already been finalized")]
    AlreadyFinalized,
    #[error("The pipeline has not been finalized yet")]
    NotFinalized,
    #[error("A pipeline needs at least one step before it can be finalized")]
    NoSteps,
    #[error("Step {step} takes `{expected}` but is fed `{found}`")]
    StepTypeMismatch {
        step: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Pipeline tasks can only be spawned from within a Tokio runtime")]
    NoRuntime,
    #[error("The pipeline is not accepting work anymore")]
    Rejected,
    #[error("The pipeline faulted")]
    Faulted(#[source] StepFault),
}
