use tokio::sync::watch;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("The work unit has already been completed")]
    AlreadyCompleted,
}

/// The firing side of a one-shot completion signal.
#[derive(Debug)]
pub(crate) struct CompletionSource {
    sender: watch::Sender<bool>,
}

impl CompletionSource {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub(crate) fn complete(&self) -> Result<(), CompletionError> {
        if self.sender.send_replace(true) {
            return Err(CompletionError::AlreadyCompleted);
        }
        Ok(())
    }

    pub(crate) fn is_completed(&self) -> bool {
        *self.sender.borrow()
    }

    pub(crate) fn subscribe(&self) -> Completion {
        Completion {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A read-only view of a work unit's completion signal.
///
/// Cheap to clone; every clone observes the same signal.
#[derive(Clone, Debug)]
pub struct Completion {
    receiver: watch::Receiver<bool>,
}

impl Completion {
    pub fn is_completed(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the work unit to be completed.
    ///
    /// Returns `false` if the unit was dropped without ever being completed.
    pub async fn wait(&self) -> bool {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return true;
            }
            if receiver.changed().await.is_err() {
                return *receiver.borrow();
            }
        }
    }
}
