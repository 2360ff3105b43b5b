use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Cooperative cancellation shared between a caller and its in-flight sends.
/// Checked before every network call; never interrupts one in progress.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    canceled: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        assert!(clone.check().is_ok());

        signal.cancel();
        assert!(clone.is_canceled());
        assert!(matches!(clone.check(), Err(Error::Canceled)));
    }
}
