use core_types::LedgerEvent;
use tokio::sync::broadcast;

/// In-process fan-out of committed ledger mutations. Publishing never fails:
/// a mutation that already committed must not be reported as an error just
/// because nobody is listening.
#[derive(Clone)]
pub struct LedgerBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl LedgerBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: LedgerEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::trace!("ledger event dropped; no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LedgerBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

/// Helper for components that hold an optional bus.
pub fn emit(bus: Option<&LedgerBus>, event: LedgerEvent) {
    if let Some(bus) = bus {
        bus.publish(event);
    }
}
