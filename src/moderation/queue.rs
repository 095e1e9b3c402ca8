//! Pending-request registry.
//!
//! Each moderated request is registered under the id its request record was
//! saved with, together with the sender half of a one-shot release signal.
//! The serving task waits on the receiver half until an operator approves the
//! id, the whole queue is flushed, or the entry is dropped.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use waypost::moderation::ModerationQueue;
//! use tokio::sync::oneshot;
//!
//! let queue = ModerationQueue::new();
//!
//! let (tx, rx) = oneshot::channel();
//! queue.add(7, tx);
//!
//! // Later, from the operator console
//! queue.approve(7)?;
//!
//! rx.await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Release signal handed to a waiting request.
pub type ReleaseSignal = oneshot::Sender<()>;

/// Errors from moderation queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModerationError {
    /// No pending entry with this id.
    #[error("No pending request with id {0}")]
    NotFound(u64),

    /// The waiting request went away before it could be released.
    #[error("Request {0} is no longer waiting")]
    Released(u64),
}

/// Registry of requests held for approval.
#[derive(Debug, Default)]
pub struct ModerationQueue {
    pending: Mutex<HashMap<u64, ReleaseSignal>>,
}

impl ModerationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `signal` as the release for request `id`.
    ///
    /// An existing entry for the same id is replaced; its waiter is treated
    /// as dropped.
    pub fn add(&self, id: u64, signal: ReleaseSignal) {
        let replaced = self.pending.lock().unwrap().insert(id, signal);
        if replaced.is_some() {
            debug!("Replaced pending moderation entry {}", id);
        } else {
            debug!("Request {} held for moderation", id);
        }
    }

    /// Remove `id` without releasing it.
    ///
    /// Returns whether an entry was present.
    pub fn remove(&self, id: u64) -> bool {
        self.pending.lock().unwrap().remove(&id).is_some()
    }

    /// Release and remove a single pending request.
    ///
    /// # Errors
    ///
    /// - [`ModerationError::NotFound`] if `id` is not pending
    /// - [`ModerationError::Released`] if its waiter has already gone away
    pub fn approve(&self, id: u64) -> Result<(), ModerationError> {
        let signal = self
            .pending
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(ModerationError::NotFound(id))?;

        debug!("Approved request {}", id);
        signal.send(()).map_err(|_| ModerationError::Released(id))
    }

    /// Release every pending request and clear the queue.
    ///
    /// Returns the number of entries that were pending.
    pub fn flush(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };

        let count = drained.len();
        for (id, signal) in drained {
            if signal.send(()).is_err() {
                debug!("Flushed request {} was no longer waiting", id);
            }
        }
        if count > 0 {
            info!("Released {} pending requests", count);
        }
        count
    }

    /// Snapshot of pending ids, in ascending order.
    pub fn list(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: u64) -> bool {
        self.pending.lock().unwrap().contains_key(&id)
    }
}
