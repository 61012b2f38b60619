//! Subscription manager and event fan-out
//!
//! The relay owns the [`EventLog`]. Every connection registers an outgoing
//! channel; packets it receives are dispatched here together with its
//! [`ConnectionId`]. Appends and broadcasts of one branch happen under that
//! branch's lock, so every subscriber observes the same tick order and a
//! subscription's backlog is always delivered before its live events.

use crate::protocol::*;
use crate::server::database::EventLog;
use crate::types::{BranchKey, Error, ErrorCode, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Identifies one client connection for the lifetime of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    key: BranchKey,
    color: Option<u32>,
}

#[derive(Debug)]
struct Peer {
    outgoing: mpsc::UnboundedSender<Packet>,
    subscription: Option<Subscription>,
}

type BranchLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
pub struct Relay {
    log: EventLog,
    next_connection: AtomicU64,
    peers: Mutex<HashMap<ConnectionId, Peer>>,
    branch_locks: Mutex<HashMap<BranchKey, BranchLock>>,
}

impl Relay {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            next_connection: AtomicU64::new(0),
            peers: Mutex::new(HashMap::new()),
            branch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    /// Registers a connection whose outbound packets go to `outgoing`,
    /// unless `max_peers` connections are registered already.
    pub fn try_register(
        &self,
        outgoing: mpsc::UnboundedSender<Packet>,
        max_peers: usize,
    ) -> Option<ConnectionId> {
        let mut peers = self.peers();
        if peers.len() >= max_peers {
            return None;
        }

        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        peers.insert(
            id,
            Peer {
                outgoing,
                subscription: None,
            },
        );
        tracing::debug!(connection = %id, "Registered connection");
        Some(id)
    }

    /// Forgets a connection. The event log is left untouched.
    pub fn unregister(&self, id: ConnectionId) {
        self.leave(id);
        self.peers().remove(&id);
        tracing::debug!(connection = %id, "Unregistered connection");
    }

    /// Handles one packet received from `from`.
    pub async fn dispatch(&self, from: ConnectionId, packet: Packet) {
        tracing::debug!(connection = %from, tag = packet.tag(), "Dispatching packet");

        match packet {
            Packet::Subscribe(subscribe) => {
                if let Err(error) = self.subscribe(from, subscribe).await {
                    tracing::warn!(connection = %from, "Subscription refused: {}", error);
                    self.send(from, error_packet(None, &error));
                }
            }
            Packet::Unsubscribe(_) => self.leave(from),
            Packet::UpdateCursors(cursors) => self.update_cursors(from, cursors),
            Packet::Event(event) => {
                if let Err(error) = self.publish(from, event).await {
                    tracing::error!(connection = %from, "Failed to publish event: {}", error);
                    self.send(from, error_packet(None, &error));
                }
            }
            Packet::GetRepositories(Exchange::Request(id, _)) => {
                let reply = self
                    .log
                    .select_repositories()
                    .map(|repos| GetRepositories::response(id, GetRepositoriesReply { repos }));
                self.reply(from, id, reply);
            }
            Packet::GetBranches(Exchange::Request(id, query)) => {
                let reply = self
                    .log
                    .select_branches(&query.repo)
                    .map(|branches| GetBranches::response(id, GetBranchesReply { branches }));
                self.reply(from, id, reply);
            }
            Packet::NewRepository(Exchange::Request(id, query)) => {
                let reply = self
                    .log
                    .insert_repository(&query.repo)
                    .map(|()| NewRepository::response(id, Ack {}));
                self.reply(from, id, reply);
            }
            Packet::NewBranch(Exchange::Request(id, query)) => {
                let mut branch = query.branch;
                branch.tick = None;
                let reply = self
                    .log
                    .insert_branch(&branch)
                    .map(|()| NewBranch::response(id, Ack {}));
                self.reply(from, id, reply);
            }
            Packet::UploadDatabase(Exchange::Request(id, query)) => {
                let reply = self
                    .log
                    .store_snapshot(&query.repo, &query.branch, &query.content)
                    .map(|()| UploadDatabase::response(id, Ack {}));
                self.reply(from, id, reply);
            }
            Packet::DownloadDatabase(Exchange::Request(id, query)) => {
                let reply = self
                    .log
                    .load_snapshot(&query.repo, &query.branch)
                    .map(|content| DownloadDatabase::response(id, DownloadDatabaseReply { content }));
                self.reply(from, id, reply);
            }
            other => {
                tracing::warn!(connection = %from, tag = other.tag(), "Ignoring packet only a relay sends");
                let error = Error::Protocol(crate::types::ProtocolError::Unexpected(
                    other.tag().to_string(),
                ));
                self.send(from, error_packet(None, &error));
            }
        }
    }

    /// Attaches a connection to a branch and replays what it missed.
    async fn subscribe(&self, from: ConnectionId, subscribe: Subscribe) -> Result<()> {
        if !self.log.branch_exists(&subscribe.repo, &subscribe.branch)? {
            return Err(Error::UnknownBranch {
                repo: subscribe.repo,
                branch: subscribe.branch,
            });
        }

        // Switching branches leaves the previous one first.
        self.leave(from);
        self.send(
            from,
            Packet::Subscribed(Subscribed {
                epoch: subscribe.epoch,
            }),
        );

        let key = BranchKey::new(&subscribe.repo, &subscribe.branch);
        let lock = self.branch_lock(&key);
        let _guard = lock.lock().await;

        let backlog = self.log.read_events(&key.repo, &key.branch, subscribe.tick)?;
        let last_tick = self.log.last_tick(&key.repo, &key.branch)?;
        tracing::info!(
            connection = %from,
            branch = %key,
            since = subscribe.tick,
            backlog = backlog.len(),
            "Session subscribed"
        );

        for event in backlog {
            self.send(from, Packet::Event(event));
        }
        self.send(from, Packet::Synced(Synced { tick: last_tick }));

        if let Some(peer) = self.peers().get_mut(&from) {
            peer.subscription = Some(Subscription {
                key: key.clone(),
                color: subscribe.color,
            });
        }
        self.forward(from, &key, Packet::Subscribe(subscribe));
        Ok(())
    }

    /// Detaches a connection from its branch, telling the remaining sessions.
    fn leave(&self, from: ConnectionId) {
        let subscription = self
            .peers()
            .get_mut(&from)
            .and_then(|peer| peer.subscription.take());

        if let Some(Subscription { key, color }) = subscription {
            tracing::info!(connection = %from, branch = %key, "Session unsubscribed");
            self.forward(from, &key, Packet::Unsubscribe(Unsubscribe { color }));
        }
    }

    /// Persists an event at the next tick and fans it out.
    async fn publish(&self, from: ConnectionId, event: Event) -> Result<()> {
        let key = self.subscription_of(from).ok_or(Error::NotSubscribed)?.key;
        let lock = self.branch_lock(&key);
        let _guard = lock.lock().await;

        let tick = self.log.append_event(&key.repo, &key.branch, &event.payload)?;
        if event.tick != 0 && event.tick != tick {
            tracing::warn!(
                connection = %from,
                branch = %key,
                expected = event.tick,
                allocated = tick,
                "Desynchronized client, using the relay's tick"
            );
        }

        self.send(from, Packet::Committed(Committed { tick }));
        self.forward(from, &key, Packet::Event(Event::new(tick, event.payload)));
        Ok(())
    }

    fn update_cursors(&self, from: ConnectionId, mut cursors: UpdateCursors) {
        let Some(subscription) = self.subscription_of(from) else {
            tracing::debug!(connection = %from, "Dropping cursor update from unsubscribed session");
            return;
        };

        cursors.color = subscription.color;
        self.forward(from, &subscription.key, Packet::UpdateCursors(cursors));
    }

    fn reply(&self, to: ConnectionId, id: QueryId, reply: Result<Packet>) {
        let packet = reply.unwrap_or_else(|error| {
            tracing::warn!(connection = %to, %id, "Query failed: {}", error);
            error_packet(Some(id), &error)
        });
        self.send(to, packet);
    }

    fn send(&self, to: ConnectionId, packet: Packet) {
        let peers = self.peers();
        let Some(peer) = peers.get(&to) else {
            return;
        };
        if peer.outgoing.send(packet).is_err() {
            tracing::warn!(connection = %to, "Failed to queue packet, connection closing");
        }
    }

    /// Sends a packet to every other session subscribed to `key`.
    fn forward(&self, from: ConnectionId, key: &BranchKey, packet: Packet) {
        let peers = self.peers();
        let recipients = peers.iter().filter(|(id, peer)| {
            **id != from
                && peer
                    .subscription
                    .as_ref()
                    .is_some_and(|subscription| &subscription.key == key)
        });

        for (id, peer) in recipients {
            if peer.outgoing.send(packet.clone()).is_err() {
                tracing::warn!(connection = %id, branch = %key, "Failed to forward packet");
            }
        }
    }

    fn subscription_of(&self, id: ConnectionId) -> Option<Subscription> {
        self.peers()
            .get(&id)
            .and_then(|peer| peer.subscription.clone())
    }

    fn branch_lock(&self, key: &BranchKey) -> BranchLock {
        self.branch_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<ConnectionId, Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn error_packet(id: Option<QueryId>, error: &Error) -> Packet {
    Packet::Error(
        id,
        ErrorReply {
            code: error.code(),
            message: error.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Branch, Repository};
    use chrono::Utc;

    struct Connection {
        id: ConnectionId,
        incoming: mpsc::UnboundedReceiver<Packet>,
    }

    impl Connection {
        fn open(relay: &Relay) -> Self {
            let (sender, incoming) = mpsc::unbounded_channel();
            Self {
                id: relay
                    .try_register(sender, usize::MAX)
                    .expect("unlimited relay accepts every connection"),
                incoming,
            }
        }

        fn drain(&mut self) -> Vec<Packet> {
            std::iter::from_fn(|| self.incoming.try_recv().ok()).collect()
        }
    }

    fn relay_with_branch() -> Relay {
        let log = EventLog::open_in_memory().expect("Failed to open event log");
        log.insert_repository(&Repository {
            name: "repoX".to_string(),
            hash: "cafe".to_string(),
            file: "a.out".to_string(),
            kind: "ELF".to_string(),
            date: Utc::now(),
        })
        .unwrap();
        log.insert_branch(&Branch {
            repo: "repoX".to_string(),
            name: "main".to_string(),
            date: Utc::now(),
            tick: None,
        })
        .unwrap();
        Relay::new(log)
    }

    fn subscribe(tick: u64, color: u32) -> Packet {
        Packet::Subscribe(Subscribe {
            repo: "repoX".to_string(),
            branch: "main".to_string(),
            tick,
            color: Some(color),
            epoch: tick + 1,
        })
    }

    fn event(n: u64) -> Packet {
        Packet::Event(Event::new(0, EventPayload::new("make_code").with("ea", n)))
    }

    #[tokio::test]
    async fn backlog_is_followed_by_synced_marker() {
        let relay = relay_with_branch();
        let mut author = Connection::open(&relay);
        relay.dispatch(author.id, subscribe(0, 1)).await;
        for n in 0..3 {
            relay.dispatch(author.id, event(n)).await;
        }

        let mut late = Connection::open(&relay);
        relay.dispatch(late.id, subscribe(1, 2)).await;

        let ticks: Vec<_> = late
            .drain()
            .into_iter()
            .map(|packet| match packet {
                Packet::Subscribed(subscribed) => format!("subscribed {}", subscribed.epoch),
                Packet::Event(event) => format!("event {}", event.tick),
                Packet::Synced(synced) => format!("synced {}", synced.tick),
                other => panic!("unexpected packet {:?}", other),
            })
            .collect();
        assert_eq!(
            ticks,
            vec!["subscribed 2", "event 2", "event 3", "synced 3"]
        );

        let acks: Vec<_> = author
            .drain()
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Committed(committed) => Some(committed.tick),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn presence_is_stamped_with_the_sender_color() {
        let relay = relay_with_branch();
        let mut first = Connection::open(&relay);
        let mut second = Connection::open(&relay);
        relay.dispatch(first.id, subscribe(0, 0xff0000)).await;
        relay.dispatch(second.id, subscribe(0, 0x00ff00)).await;
        first.drain();
        second.drain();

        relay
            .dispatch(
                first.id,
                Packet::UpdateCursors(UpdateCursors {
                    position: 0x401000,
                    color: None,
                }),
            )
            .await;
        relay.dispatch(first.id, Packet::Unsubscribe(Unsubscribe::default())).await;

        assert_eq!(
            second.drain(),
            vec![
                Packet::UpdateCursors(UpdateCursors {
                    position: 0x401000,
                    color: Some(0xff0000),
                }),
                Packet::Unsubscribe(Unsubscribe {
                    color: Some(0xff0000)
                }),
            ]
        );
        assert!(first.drain().is_empty());
    }

    #[tokio::test]
    async fn event_without_subscription_is_refused() {
        let relay = relay_with_branch();
        let mut connection = Connection::open(&relay);

        relay.dispatch(connection.id, event(1)).await;

        assert!(matches!(
            connection.drain().as_slice(),
            [Packet::Error(
                None,
                ErrorReply {
                    code: ErrorCode::NotSubscribed,
                    ..
                }
            )]
        ));
        assert_eq!(relay.log().last_tick("repoX", "main").unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribing_to_unknown_branch_replies_with_error() {
        let relay = relay_with_branch();
        let mut connection = Connection::open(&relay);

        relay
            .dispatch(
                connection.id,
                Packet::Subscribe(Subscribe {
                    repo: "repoX".to_string(),
                    branch: "ghost".to_string(),
                    tick: 0,
                    color: None,
                    epoch: 1,
                }),
            )
            .await;

        assert!(matches!(
            connection.drain().as_slice(),
            [Packet::Error(
                None,
                ErrorReply {
                    code: ErrorCode::NotFound,
                    ..
                }
            )]
        ));
    }

    #[tokio::test]
    async fn unregistered_connection_stops_receiving() {
        let relay = relay_with_branch();
        let author = Connection::open(&relay);
        let mut gone = Connection::open(&relay);
        relay.dispatch(author.id, subscribe(0, 1)).await;
        relay.dispatch(gone.id, subscribe(0, 2)).await;
        gone.drain();

        relay.unregister(gone.id);
        relay.dispatch(author.id, event(1)).await;

        assert_eq!(relay.peer_count(), 1);
        assert!(gone.drain().is_empty());
        assert_eq!(relay.log().last_tick("repoX", "main").unwrap(), 1);
    }

    #[tokio::test]
    async fn switching_branches_confirms_before_the_new_backlog() {
        let relay = relay_with_branch();
        relay
            .log()
            .insert_branch(&Branch {
                repo: "repoX".to_string(),
                name: "dev".to_string(),
                date: Utc::now(),
                tick: None,
            })
            .unwrap();
        let mut author = Connection::open(&relay);
        let mut switcher = Connection::open(&relay);
        relay.dispatch(author.id, subscribe(0, 1)).await;
        relay.dispatch(switcher.id, subscribe(0, 2)).await;
        relay.dispatch(author.id, event(1)).await;

        relay
            .dispatch(
                switcher.id,
                Packet::Subscribe(Subscribe {
                    repo: "repoX".to_string(),
                    branch: "dev".to_string(),
                    tick: 0,
                    color: Some(2),
                    epoch: 7,
                }),
            )
            .await;

        let received = switcher.drain();
        let marker = received
            .iter()
            .position(|packet| *packet == Packet::Subscribed(Subscribed { epoch: 7 }))
            .expect("switch is confirmed");
        assert!(matches!(received[marker - 1], Packet::Event(Event { tick: 1, .. })));
        assert_eq!(received[marker + 1], Packet::Synced(Synced { tick: 0 }));
    }

    #[tokio::test]
    async fn registration_stops_at_the_peer_limit() {
        let relay = relay_with_branch();
        let (sender, _incoming) = mpsc::unbounded_channel();

        let first = relay.try_register(sender.clone(), 2).unwrap();
        relay.try_register(sender.clone(), 2).unwrap();
        assert_eq!(relay.try_register(sender.clone(), 2), None);

        relay.unregister(first);
        assert!(relay.try_register(sender, 2).is_some());
        assert_eq!(relay.peer_count(), 2);
    }
}
