//! Last-writer-wins debouncing.
//!
//! The discovery driver routes every reconciliation after the initial
//! snapshot through a debouncer so rolling deployments and flapping health
//! checks collapse into one change: the first stage arms a timer, later
//! stages overwrite the pending value, and whatever is pending when the
//! timer fires is delivered. The timer itself is never cancelled or
//! restarted; overwriting the staged input is sufficient.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

pub struct Debouncer<T> {
    period: Duration,
    slot: Arc<Mutex<Option<T>>>,
    sink: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Delivered values are sent on `sink` after `period` of quiet.
    pub fn new(period: Duration, sink: mpsc::UnboundedSender<T>) -> Self {
        Debouncer {
            period,
            slot: Arc::new(Mutex::new(None)),
            sink,
        }
    }

    /// Stage `value` for delivery. Overwrites any value already pending.
    pub fn stage(&self, value: T) {
        let mut slot = self.slot.lock().unwrap();
        let armed = slot.is_some();
        *slot = Some(value);
        if armed {
            debug!("debounce timer already armed, staged input overwritten");
            return;
        }
        drop(slot);

        let slot = Arc::clone(&self.slot);
        let sink = self.sink.clone();
        let period = self.period;
        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            if let Some(latest) = slot.lock().unwrap().take() {
                let _ = sink.send(latest);
            }
        });
    }
}
