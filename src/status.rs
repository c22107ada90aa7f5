use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle status of a [`Flagship`](crate::Flagship) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SdkStatus {
    #[display("NOT_INITIALIZED")]
    NotInitialized,
    /// Waiting for the first bucketing file.
    #[display("INITIALIZING")]
    Initializing,
    /// Kill switch set on the server: tracking is deactivated and flags return their defaults.
    #[display("PANIC")]
    Panic,
    #[display("INITIALIZED")]
    Initialized,
}

/// Shared, observable SDK status.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    sender: Arc<watch::Sender<SdkStatus>>,
}

impl StatusHandle {
    pub fn new(status: SdkStatus) -> StatusHandle {
        let (sender, _) = watch::channel(status);
        StatusHandle {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> SdkStatus {
        *self.sender.borrow()
    }

    pub fn is_panic(&self) -> bool {
        self.get() == SdkStatus::Panic
    }

    /// Set `status`, notifying subscribers only when it changes.
    pub fn set(&self, status: SdkStatus) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::info!(target: "flagship", status:display = status; "sdk status changed");
        }
    }

    /// Apply the panic flag of a decision or bucketing file.
    pub fn apply_panic(&self, panic: bool) {
        if panic {
            self.set(SdkStatus::Panic);
        } else {
            self.set(SdkStatus::Initialized);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SdkStatus> {
        self.sender.subscribe()
    }
}
