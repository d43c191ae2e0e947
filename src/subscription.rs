use crate::types::FeatureValue;
use tokio::sync::broadcast;

/// A value published for a feature
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureChange {
    pub feature: String,
    pub value: FeatureValue,
}

/// Receiver for every value the client publishes
pub struct ChangeReceiver {
    rx: broadcast::Receiver<FeatureChange>,
}

impl ChangeReceiver {
    /// Create a new change receiver
    pub(crate) fn new(rx: broadcast::Receiver<FeatureChange>) -> Self {
        Self { rx }
    }

    /// Receive the next change
    ///
    /// Returns `None` once the client has been dropped. A receiver that falls
    /// behind skips the changes it missed; the value cache still has them.
    pub async fn recv(&mut self) -> Option<FeatureChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Change receiver lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a change without waiting
    pub fn try_recv(&mut self) -> Option<FeatureChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Change receiver lagged by {} messages", n);
                }
                Err(_) => return None,
            }
        }
    }
}
