//! Request/reply correlation for one app-server connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::app_server_protocol::{RpcId, RpcOutcome};
use crate::lock_or_recover;

/// A registered outgoing request waiting for its reply.
#[derive(Debug)]
pub struct PendingCall {
    pub id: i64,
    pub key: String,
    receiver: oneshot::Receiver<RpcOutcome>,
}

#[derive(Debug, Default)]
struct CorrelatorSlots {
    pending: HashMap<String, oneshot::Sender<RpcOutcome>>,
    terminated: bool,
}

/// Allocates request ids and matches replies to their reply slots.
///
/// Every registered slot resolves exactly once: with a reply, with
/// [`RpcOutcome::Terminated`] when the connection ends, or by being removed on
/// timeout.
#[derive(Debug)]
pub struct RpcCorrelator {
    next_id: AtomicI64,
    slots: Mutex<CorrelatorSlots>,
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(0),
            slots: Mutex::new(CorrelatorSlots::default()),
        }
    }

    /// Registers a reply slot under a fresh id. Returns `None` once terminated.
    pub fn register(&self) -> Option<PendingCall> {
        let mut slots = lock_or_recover(&self.slots);
        if slots.terminated {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let key = id.to_string();
        let (sender, receiver) = oneshot::channel();
        slots.pending.insert(key.clone(), sender);
        Some(PendingCall { id, key, receiver })
    }

    /// Delivers a reply. Returns false when no slot is registered for `id`.
    pub fn complete(&self, id: &RpcId, outcome: RpcOutcome) -> bool {
        let sender = lock_or_recover(&self.slots)
            .pending
            .remove(id.correlation_key().as_str());
        match sender {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        lock_or_recover(&self.slots).pending.remove(key).is_some()
    }

    /// Resolves every pending slot with [`RpcOutcome::Terminated`] and refuses
    /// further registrations. Later calls are no-ops.
    pub fn terminate_all(&self) -> usize {
        let drained = {
            let mut slots = lock_or_recover(&self.slots);
            if slots.terminated {
                return 0;
            }
            slots.terminated = true;
            std::mem::take(&mut slots.pending)
        };
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(RpcOutcome::Terminated);
        }
        count
    }

    pub fn is_terminated(&self) -> bool {
        lock_or_recover(&self.slots).terminated
    }

    pub fn pending_count(&self) -> usize {
        lock_or_recover(&self.slots).pending.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock_or_recover(&self.slots).pending.contains_key(key)
    }

    /// Waits for the reply to `call`. On timeout the slot is unregistered and
    /// `None` is returned.
    pub async fn wait(&self, call: PendingCall, timeout: Duration) -> Option<RpcOutcome> {
        let PendingCall { key, receiver, .. } = call;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => Some(RpcOutcome::Terminated),
            Err(_) => {
                self.cancel(key.as_str());
                None
            }
        }
    }
}
