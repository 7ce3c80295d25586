use crossbeam_channel::Sender;

/// Notifications raised by the acquisition core. Each fires at most once
/// per occurrence and is consumed by the owning application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcqEvent {
    /// The first non-empty block of scans was read.
    GotFirstScan,
    /// The output queue was saturated and this span was dropped.
    BufferOverrun { first_sample: u64, n_samples: usize },
    /// Fatal driver failure; the acquisition has stopped.
    DaqError(String),
    FastSettleCompleted,
}

/// Fire-and-forget sender for [`AcqEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<AcqEvent>,
}

impl EventSender {
    pub fn new(tx: Sender<AcqEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: AcqEvent) {
        // nobody listening is fine
        let _ = self.tx.send(event);
    }
}

impl From<Sender<AcqEvent>> for EventSender {
    fn from(tx: Sender<AcqEvent>) -> Self {
        Self::new(tx)
    }
}
