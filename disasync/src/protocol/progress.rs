//! Progress of container transfers
//!
//! Database uploads and downloads can be large. A caller interested in how
//! far one has come watches its [`QueryId`]; the writer reports bytes of the
//! content section sent, the codec reports bytes of it received.

use crate::protocol::QueryId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Bytes of a container's content moved so far, out of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: usize,
    pub total: usize,
}

pub type Observer = Box<dyn Fn(Progress) + Send + Sync>;

/// Observers of in-flight transfers, by query.
#[derive(Default)]
pub struct Transfers {
    observers: Mutex<HashMap<QueryId, Observer>>,
}

/// Keeps an observer registered until dropped.
#[must_use = "the observer is removed when the watch is dropped"]
pub struct Watch<'a> {
    id: QueryId,
    transfers: &'a Transfers,
}

impl Transfers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self, id: QueryId, observer: Observer) -> Watch<'_> {
        self.lock().insert(id, observer);
        Watch {
            id,
            transfers: self,
        }
    }

    /// Hands `progress` to whoever watches `id`. Unwatched ids are ignored.
    pub fn report(&self, id: QueryId, progress: Progress) {
        if let Some(observer) = self.lock().get(&id) {
            observer(progress);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueryId, Observer>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Transfers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfers")
            .field("watched", &self.lock().len())
            .finish()
    }
}

impl Drop for Watch<'_> {
    fn drop(&mut self) {
        self.transfers.lock().remove(&self.id);
    }
}
