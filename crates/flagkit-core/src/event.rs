use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{FlagError, Result};
use crate::flagging::{FlagId, Flagging};

/// Events emitted when the ledger or its counts change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlagEvent {
    Flagged(Box<Flagging>),
    Unflagged(Box<Flagging>),
    FlaggingUpdated(Box<Flagging>),
    CountsRebuilt { flag_id: FlagId, counts: usize },
}

/// Single-consumer event channel shared by the ledger and the counter.
///
/// Nothing is queued until a subscriber exists. Once the receiver is
/// dropped the sender is released and later events are discarded.
pub struct EventChannel {
    inner: Mutex<Subscription>,
}

#[derive(Default)]
struct Subscription {
    tx: Option<Sender<FlagEvent>>,
    taken: bool,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Subscription::default()),
        }
    }

    pub fn emit(&self, event: FlagEvent) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let disconnected = match inner.tx.as_ref() {
            Some(tx) => tx.send(event).is_err(),
            None => false,
        };
        if disconnected {
            inner.tx = None;
        }
    }

    /// Open the receiving end. Only the first caller gets it.
    pub fn subscribe(&self) -> Result<Receiver<FlagEvent>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| FlagError::Storage(e.to_string()))?;
        if inner.taken {
            return Err(FlagError::Storage(
                "subscribe: receiver already taken".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel();
        inner.tx = Some(tx);
        inner.taken = true;
        Ok(rx)
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
