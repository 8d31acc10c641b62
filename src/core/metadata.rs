//! Instrument metadata gate
//!
//! List-send commands round values to per-phase digit counts that come
//! from the instrument's extension metadata, which is loaded lazily by the
//! surrounding application. A send operation must not issue its first
//! command before those digits are known. The gate is an explicit async
//! precondition: the plumbing publishes metadata once available, the
//! operation awaits it. No command leaves before `ready` resolves.

use tokio::sync::watch;

use crate::core::list::ListPhase;

/// Per-phase rounding digit counts for list values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListDigits {
    /// Fractional digits for dwell values (seconds).
    pub dwell: u32,
    /// Fractional digits for voltage values.
    pub voltage: u32,
    /// Fractional digits for current values.
    pub current: u32,
}

impl ListDigits {
    /// Digit count for one phase.
    pub fn for_phase(&self, phase: ListPhase) -> u32 {
        match phase {
            ListPhase::Dwell => self.dwell,
            ListPhase::Voltage => self.voltage,
            ListPhase::Current => self.current,
        }
    }
}

impl Default for ListDigits {
    fn default() -> Self {
        Self {
            dwell: 4,
            voltage: 3,
            current: 3,
        }
    }
}

/// Metadata the protocol core needs from the instrument extension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentMetadata {
    /// List rounding digits.
    pub list_digits: ListDigits,
}

/// Publishing half; owned by whatever loads the instrument extension.
#[derive(Debug)]
pub struct MetadataPublisher {
    tx: watch::Sender<Option<InstrumentMetadata>>,
}

impl MetadataPublisher {
    /// Make metadata available to waiting operations.
    pub fn publish(&self, metadata: InstrumentMetadata) {
        let _ = self.tx.send(Some(metadata));
    }
}

/// Awaitable metadata precondition.
#[derive(Debug, Clone)]
pub struct MetadataGate {
    rx: watch::Receiver<Option<InstrumentMetadata>>,
}

impl MetadataGate {
    /// Resolve once metadata has been published. Returns `None` when the
    /// publisher was dropped without ever publishing.
    pub async fn ready(&mut self) -> Option<InstrumentMetadata> {
        loop {
            if let Some(metadata) = self.rx.borrow_and_update().clone() {
                return Some(metadata);
            }
            self.rx.changed().await.ok()?;
        }
    }
}

/// Create a publisher/gate pair.
pub fn metadata_channel() -> (MetadataPublisher, MetadataGate) {
    let (tx, rx) = watch::channel(None);
    (MetadataPublisher { tx }, MetadataGate { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_waits_for_publish() {
        let (publisher, mut gate) = metadata_channel();

        let waiter = tokio::spawn(async move { gate.ready().await });
        publisher.publish(InstrumentMetadata::default());

        let metadata = waiter.await.unwrap();
        assert_eq!(metadata, Some(InstrumentMetadata::default()));
    }

    #[tokio::test]
    async fn test_gate_resolves_immediately_when_already_published() {
        let (publisher, mut gate) = metadata_channel();
        publisher.publish(InstrumentMetadata::default());
        assert!(gate.ready().await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_publisher_yields_none() {
        let (publisher, mut gate) = metadata_channel();
        drop(publisher);
        assert_eq!(gate.ready().await, None);
    }
}
