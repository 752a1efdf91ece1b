//! Pending acknowledgements
//!
//! At most one outstanding request per command kind. Registering a new
//! waiter for a kind replaces the previous one, whose receiver then resolves
//! as [`AckOutcome::Superseded`].

use crate::infrastructure::bridge::protocol::{Ack, AckKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Rejected(Option<String>),
    TimedOut,
    /// Waiter replaced or the session went away
    Superseded,
}

impl AckOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AckOutcome::Accepted)
    }

    pub fn describe(&self) -> String {
        match self {
            AckOutcome::Accepted => "accepted".to_string(),
            AckOutcome::Rejected(Some(reason)) => format!("rejected: {}", reason),
            AckOutcome::Rejected(None) => "rejected".to_string(),
            AckOutcome::TimedOut => "no acknowledgement before timeout".to_string(),
            AckOutcome::Superseded => "session closed while waiting".to_string(),
        }
    }
}

#[derive(Default)]
pub struct PendingAcks {
    slots: Mutex<HashMap<AckKind, oneshot::Sender<Ack>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a waiter for `kind`. Call before sending the command so a
    /// fast reply cannot be missed.
    pub fn register(&self, kind: AckKind) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        if self.slots.lock().insert(kind, tx).is_some() {
            debug!("Replaced pending {:?} waiter", kind);
        }
        rx
    }

    /// Complete the waiter for `kind`. Returns false when nobody waited.
    pub fn resolve(&self, kind: AckKind, ack: Ack) -> bool {
        match self.slots.lock().remove(&kind) {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Resolve every pending open/config/start waiter negatively.
    pub fn fail_all(&self, reason: &str) {
        let mut slots = self.slots.lock();
        for kind in [AckKind::Open, AckKind::Config, AckKind::Start] {
            if let Some(tx) = slots.remove(&kind) {
                let _ = tx.send(Ack {
                    ok: false,
                    error: Some(reason.to_string()),
                });
            }
        }
    }

    /// Drop every waiter
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Race a waiter against `timeout`.
pub async fn wait_ack(rx: oneshot::Receiver<Ack>, timeout: Duration) -> AckOutcome {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => AckOutcome::TimedOut,
        Ok(Err(_)) => AckOutcome::Superseded,
        Ok(Ok(ack)) if ack.ok => AckOutcome::Accepted,
        Ok(Ok(ack)) => AckOutcome::Rejected(ack.error),
    }
}
