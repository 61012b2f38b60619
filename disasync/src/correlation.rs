//! Matching of replies to the queries that caused them
//!
//! Every query sent on a connection is registered under a fresh
//! [`QueryId`] together with a oneshot channel. The receive loop hands each
//! reply to [`PendingQueries::complete`], which wakes the waiting caller.

use crate::protocol::{Packet, QueryId};
use crate::types::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

type Continuation = oneshot::Sender<Result<Packet>>;

#[derive(Debug, Default)]
struct Registry {
    waiting: HashMap<QueryId, Continuation>,
    closed: bool,
}

/// Queries of one connection that still wait for their reply.
#[derive(Debug, Default)]
pub struct PendingQueries {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

/// Handle on a registered query, resolved by its reply.
///
/// Dropping the handle, whether the wait finished, timed out or was
/// cancelled, unregisters the query.
#[derive(Debug)]
pub struct PendingReply<'a> {
    id: QueryId,
    receiver: oneshot::Receiver<Result<Packet>>,
    owner: &'a PendingQueries,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an identifier and registers a continuation for it.
    ///
    /// Fails with [`Error::ConnectionLost`] once the connection is gone.
    pub fn register(&self) -> Result<PendingReply<'_>> {
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = oneshot::channel();

        let mut registry = self.lock();
        if registry.closed {
            return Err(Error::ConnectionLost);
        }
        registry.waiting.insert(id, sender);

        Ok(PendingReply {
            id,
            receiver,
            owner: self,
        })
    }

    /// Hands a reply to the query it answers.
    ///
    /// Returns `false` if nobody waits for it: the query already timed out,
    /// or the identifier was never issued on this connection.
    pub fn complete(&self, id: QueryId, reply: Result<Packet>) -> bool {
        let continuation = self.lock().waiting.remove(&id);

        match continuation {
            Some(continuation) => {
                if continuation.send(reply).is_err() {
                    tracing::debug!(%id, "Query caller went away before its reply arrived");
                }
                true
            }
            None => {
                tracing::warn!(%id, "Discarding reply to unknown query");
                false
            }
        }
    }

    /// Fails every waiting query with [`Error::ConnectionLost`] and refuses
    /// new registrations.
    pub fn fail_all(&self) {
        let waiting = {
            let mut registry = self.lock();
            registry.closed = true;
            std::mem::take(&mut registry.waiting)
        };

        if !waiting.is_empty() {
            tracing::debug!(count = waiting.len(), "Failing pending queries, connection lost");
        }
        for (_, continuation) in waiting {
            let _ = continuation.send(Err(Error::ConnectionLost));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: QueryId) {
        self.lock().waiting.remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // The registry holds no invariant a panicking holder could break.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PendingReply<'_> {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Waits for the reply, giving up after `timeout`.
    pub async fn wait(mut self, operation: &str, timeout: Duration) -> Result<Packet> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                tracing::warn!(id = %self.id, operation, "Query timed out");
                Err(Error::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.owner.forget(self.id);
    }
}
