use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

/// The bound of a step's input buffer when nothing else is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Defaults applied to every step of a [`Pipeline`](crate::pipeline::Pipeline).
///
/// Every field has a default, so an empty document deserializes into
/// `PipelineOptions::default()`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineOptions {
    /// How many items a step may process at the same time.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_parallelism: usize,
    /// Emit a step's outputs in the order its inputs arrived, whatever the parallelism.
    pub ordered: bool,
    /// How many items may wait in front of a step before producers are suspended.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub buffer_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 1,
            ordered: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl PipelineOptions {
    pub(crate) fn resolve(&self, overrides: StepOptions) -> ResolvedOptions {
        ResolvedOptions {
            parallelism: overrides
                .max_parallelism
                .unwrap_or(self.max_parallelism)
                .max(1),
            ordered: overrides.ordered.unwrap_or(self.ordered),
            buffer_size: overrides.buffer_size.unwrap_or(self.buffer_size).max(1),
        }
    }
}

/// Per-step overrides of the [`PipelineOptions`].
///
/// ```rust
/// use burrow::pipeline::StepOptions;
///
/// let options = StepOptions::default().parallelism(8).unordered();
/// assert_eq!(options.max_parallelism, Some(8));
/// assert_eq!(options.ordered, Some(false));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOptions {
    pub max_parallelism: Option<usize>,
    pub ordered: Option<bool>,
    pub buffer_size: Option<usize>,
}

impl StepOptions {
    pub fn parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = Some(max_parallelism);
        self
    }

    pub fn unordered(mut self) -> Self {
        self.ordered = Some(false);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub(crate) parallelism: usize,
    pub(crate) ordered: bool,
    pub(crate) buffer_size: usize,
}
