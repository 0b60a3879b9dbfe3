use crate::pipeline::block::BlockState;
use crate::pipeline::StepFault;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The states of a pipeline's steps, in step order.
pub(crate) type FaultRegistry = Arc<RwLock<Vec<Arc<BlockState>>>>;

pub(crate) fn first_fault(registry: &FaultRegistry) -> Option<StepFault> {
    registry
        .read()
        .iter()
        .find_map(|state| state.fault().cloned())
}

/// Report on the pipeline every `interval` until `shutdown` fires.
pub(crate) async fn health_check(
    name: String,
    interval: Duration,
    registry: FaultRegistry,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match first_fault(&registry) {
            Some(fault) => error!(pipeline = %name, error = %fault, "Pipeline faulted"),
            None => info!(pipeline = %name, "Pipeline healthy"),
        }
    }
    debug!(pipeline = %name, "Pipeline health check stopped");
}
