//! Client replication engine
//!
//! Tracks the tick watermark of the subscribed branch and decides, for every
//! packet the relay pushes, whether it is applied, dropped as a duplicate or
//! stale, or whether the stream has a hole that requires resubscribing.
//! The engine never performs I/O itself: packets it wants sent are returned
//! to the caller.

use crate::protocol::*;
use crate::types::{Error, ErrorCode, ProtocolError, Result, Tick};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Interface of the host editor integration.
///
/// Only [`apply_remote_event`](DocumentHooks::apply_remote_event) is
/// required; the notifications default to doing nothing.
pub trait DocumentHooks: Send {
    /// Applies a mutation made by another participant.
    ///
    /// Must be deterministic: replaying the same events yields the same
    /// document. An error leaves the watermark where it was, so the event is
    /// delivered again after the next resynchronization.
    fn apply_remote_event(&mut self, tick: Tick, payload: &EventPayload) -> anyhow::Result<()>;

    /// The backlog of a subscription has been applied.
    fn on_session_ready(&mut self, _repo: &str, _branch: &str) {}

    /// The subscription ended, either on request or because the connection was lost.
    fn on_session_closed(&mut self) {}

    fn on_peer_subscribed(&mut self, _peer: &Subscribe) {}

    fn on_peer_unsubscribed(&mut self, _peer: &Unsubscribe) {}

    fn on_cursor_update(&mut self, _cursors: &UpdateCursors) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `subscribe` sent, waiting for the relay to confirm it. Anything
    /// received meanwhile belongs to an earlier subscription.
    Subscribing,
    /// Waiting for the backlog to end with a `synced` marker.
    Replaying,
    Live,
}

#[derive(Debug, Clone)]
struct Session {
    repo: String,
    branch: String,
    color: Option<u32>,
    /// Identifies the latest `subscribe` sent for this session.
    epoch: u64,
    last_tick: Tick,
    /// Watermark the current replay started from.
    replay_from: Tick,
    /// Local events not yet acknowledged with a `committed`.
    unacknowledged: u64,
    state: SessionState,
    ready_notified: bool,
}

impl Session {
    fn subscribe_packet(&self) -> Packet {
        Packet::Subscribe(Subscribe {
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            tick: self.last_tick,
            color: self.color,
            epoch: self.epoch,
        })
    }
}

/// Raises the remote-apply flag for as long as it lives.
struct ApplyingRemote<'a>(&'a AtomicBool);

impl<'a> ApplyingRemote<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ApplyingRemote<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Replica {
    hooks: Box<dyn DocumentHooks>,
    session: Option<Session>,
    applying_remote: Arc<AtomicBool>,
    epochs: u64,
}

impl Replica {
    pub fn new(hooks: Box<dyn DocumentHooks>) -> Self {
        Self {
            hooks,
            session: None,
            applying_remote: Arc::new(AtomicBool::new(false)),
            epochs: 0,
        }
    }

    /// Set while a remote event is being applied, so the host can tell its
    /// own change notifications apart from replicated ones.
    pub fn remote_apply_flag(&self) -> Arc<AtomicBool> {
        self.applying_remote.clone()
    }

    pub fn last_tick(&self) -> Option<Tick> {
        self.session.as_ref().map(|session| session.last_tick)
    }

    pub fn state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|session| session.state)
    }

    /// Starts following a branch from `tick`, leaving any current branch.
    pub fn subscribe(
        &mut self,
        repo: &str,
        branch: &str,
        tick: Tick,
        color: Option<u32>,
    ) -> Vec<Packet> {
        let mut outgoing: Vec<Packet> = self.unsubscribe().into_iter().collect();

        let session = Session {
            repo: repo.to_string(),
            branch: branch.to_string(),
            color,
            epoch: self.next_epoch(),
            last_tick: tick,
            replay_from: tick,
            unacknowledged: 0,
            state: SessionState::Subscribing,
            ready_notified: false,
        };
        outgoing.push(session.subscribe_packet());
        self.session = Some(session);
        outgoing
    }

    /// Stops following the current branch.
    pub fn unsubscribe(&mut self) -> Option<Packet> {
        let session = self.session.take()?;
        self.hooks.on_session_closed();
        Some(Packet::Unsubscribe(Unsubscribe {
            color: session.color,
        }))
    }

    /// Wraps a locally made mutation for the relay.
    ///
    /// The tick is only a hint: the relay allocates the real one and
    /// acknowledges it with a `committed` packet.
    pub fn local_event(&mut self, payload: EventPayload) -> Result<Packet> {
        let session = self.session.as_mut().ok_or(Error::NotSubscribed)?;
        if let Some(key) = payload.reserved_key() {
            return Err(Error::ReservedKey { key });
        }

        let hint = session
            .unacknowledged
            .checked_add(1)
            .and_then(|pending| session.last_tick.checked_add(pending))
            .ok_or(ProtocolError::TickOverflow(session.last_tick))?;
        session.unacknowledged += 1;
        Ok(Packet::Event(Event::new(hint, payload)))
    }

    /// The connection is gone; the session cannot continue.
    pub fn connection_lost(&mut self) {
        if self.session.take().is_some() {
            self.hooks.on_session_closed();
        }
    }

    /// Handles a packet pushed by the relay and returns what must be sent back.
    pub fn handle(&mut self, packet: Packet) -> Vec<Packet> {
        match packet {
            Packet::Subscribed(Subscribed { epoch }) => {
                self.on_subscribed(epoch);
                Vec::new()
            }
            Packet::Error(None, reply) => {
                self.on_refused(reply);
                Vec::new()
            }
            packet if self.state() == Some(SessionState::Subscribing) => {
                tracing::debug!(tag = packet.tag(), "Dropping packet of an earlier subscription");
                Vec::new()
            }
            Packet::Event(event) => self.on_event(event),
            Packet::Committed(Committed { tick }) => self.on_committed(tick),
            Packet::Synced(Synced { tick }) => self.on_synced(tick),
            Packet::Subscribe(peer) => {
                self.hooks.on_peer_subscribed(&peer);
                Vec::new()
            }
            Packet::Unsubscribe(peer) => {
                self.hooks.on_peer_unsubscribed(&peer);
                Vec::new()
            }
            Packet::UpdateCursors(cursors) => {
                self.hooks.on_cursor_update(&cursors);
                Vec::new()
            }
            other => {
                tracing::warn!(tag = other.tag(), "Discarding unexpected packet");
                Vec::new()
            }
        }
    }

    fn next_epoch(&mut self) -> u64 {
        self.epochs = self.epochs.wrapping_add(1);
        self.epochs
    }

    fn on_subscribed(&mut self, epoch: u64) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(epoch, "Ignoring confirmation, not subscribed");
            return;
        };
        if session.state != SessionState::Subscribing || session.epoch != epoch {
            tracing::debug!(epoch, current = session.epoch, "Ignoring confirmation of an earlier subscription");
            return;
        }
        session.state = SessionState::Replaying;
    }

    fn on_event(&mut self, event: Event) -> Vec<Packet> {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(tick = event.tick, "Dropping event, not subscribed");
            return Vec::new();
        };
        let Some(expected) = session.last_tick.checked_add(1) else {
            self.tick_overflow();
            return Vec::new();
        };

        if event.tick < expected {
            tracing::debug!(tick = event.tick, last_tick = session.last_tick, "Dropping duplicate event");
            return Vec::new();
        }
        if event.tick > expected {
            let state = session.state;
            return match state {
                SessionState::Live => self.resync(Error::SequenceGap {
                    expected,
                    received: event.tick,
                }),
                _ => {
                    tracing::debug!(tick = event.tick, expected, "Dropping stale event during replay");
                    Vec::new()
                }
            };
        }

        let applied = {
            let _flag = ApplyingRemote::raise(&self.applying_remote);
            self.hooks.apply_remote_event(event.tick, &event.payload)
        };
        match applied {
            Ok(()) => session.last_tick = event.tick,
            Err(error) => {
                tracing::error!(tick = event.tick, "Failed to apply remote event: {:#}", error);
            }
        }
        Vec::new()
    }

    fn on_committed(&mut self, tick: Tick) -> Vec<Packet> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.unacknowledged = session.unacknowledged.saturating_sub(1);
        let Some(expected) = session.last_tick.checked_add(1) else {
            self.tick_overflow();
            return Vec::new();
        };

        if tick == expected {
            session.last_tick = tick;
        } else if tick > expected {
            let state = session.state;
            match state {
                SessionState::Live => {
                    return self.resync(Error::SequenceGap {
                        expected,
                        received: tick,
                    })
                }
                _ => {
                    tracing::debug!(tick, expected, "Ignoring acknowledgement from before the replay")
                }
            }
        }
        Vec::new()
    }

    fn on_synced(&mut self, tick: Tick) -> Vec<Packet> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state == SessionState::Live {
            tracing::debug!(tick, "Ignoring synced marker of a live session");
            return Vec::new();
        }

        if session.last_tick < tick {
            if session.last_tick > session.replay_from {
                let cause = Error::SequenceGap {
                    expected: session.last_tick.saturating_add(1),
                    received: tick,
                };
                return self.resync(cause);
            }
            tracing::error!(
                last_tick = session.last_tick,
                synced = tick,
                "Replay made no progress, continuing live"
            );
        }

        session.state = SessionState::Live;
        tracing::info!(
            repo = %session.repo,
            branch = %session.branch,
            last_tick = session.last_tick,
            "Replica is live"
        );
        if !session.ready_notified {
            session.ready_notified = true;
            self.hooks.on_session_ready(&session.repo, &session.branch);
        }
        Vec::new()
    }

    fn on_refused(&mut self, reply: ErrorReply) {
        tracing::error!(code = reply.code.as_str(), "Relay refused command: {}", reply.message);

        let refused_subscription = self
            .session
            .as_ref()
            .is_some_and(|session| session.state == SessionState::Subscribing && !session.ready_notified);
        if reply.code == ErrorCode::NotFound && refused_subscription {
            self.connection_lost();
        }
    }

    /// No tick can follow the watermark; the branch cannot be followed further.
    fn tick_overflow(&mut self) {
        if let Some(session) = &self.session {
            let error = ProtocolError::TickOverflow(session.last_tick);
            tracing::error!(repo = %session.repo, branch = %session.branch, "Closing session: {}", error);
        }
        self.connection_lost();
    }

    /// Resubscribes at the last good tick.
    fn resync(&mut self, cause: Error) -> Vec<Packet> {
        let epoch = self.next_epoch();
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        tracing::warn!(last_tick = session.last_tick, "Resynchronizing: {}", cause);

        session.epoch = epoch;
        session.state = SessionState::Subscribing;
        session.replay_from = session.last_tick;
        session.unacknowledged = 0;
        vec![
            Packet::Unsubscribe(Unsubscribe {
                color: session.color,
            }),
            session.subscribe_packet(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        applied: Vec<Tick>,
        flag_seen: Vec<bool>,
        ready: usize,
        closed: usize,
        cursors: Vec<u64>,
    }

    struct Recorder {
        recorded: Arc<Mutex<Recorded>>,
        flag: Option<Arc<AtomicBool>>,
        fail_at: Option<Tick>,
    }

    impl DocumentHooks for Recorder {
        fn apply_remote_event(&mut self, tick: Tick, _: &EventPayload) -> anyhow::Result<()> {
            if self.fail_at == Some(tick) {
                self.fail_at = None;
                anyhow::bail!("cannot apply {}", tick);
            }
            let mut recorded = self.recorded.lock().unwrap();
            recorded.applied.push(tick);
            if let Some(flag) = &self.flag {
                recorded.flag_seen.push(flag.load(Ordering::SeqCst));
            }
            Ok(())
        }

        fn on_session_ready(&mut self, _: &str, _: &str) {
            self.recorded.lock().unwrap().ready += 1;
        }

        fn on_session_closed(&mut self) {
            self.recorded.lock().unwrap().closed += 1;
        }

        fn on_cursor_update(&mut self, cursors: &UpdateCursors) {
            self.recorded.lock().unwrap().cursors.push(cursors.position);
        }
    }

    fn replica(fail_at: Option<Tick>) -> (Replica, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let replica = Replica::new(Box::new(Recorder {
            recorded: recorded.clone(),
            flag: None,
            fail_at,
        }));
        (replica, recorded)
    }

    fn event(tick: Tick) -> Packet {
        Packet::Event(Event::new(tick, EventPayload::new("make_data").with("ea", tick)))
    }

    /// Delivers the relay's confirmation of the latest subscription.
    fn confirm(replica: &mut Replica) {
        let epoch = replica.session.as_ref().unwrap().epoch;
        replica.handle(Packet::Subscribed(Subscribed { epoch }));
    }

    fn live_replica() -> (Replica, Arc<Mutex<Recorded>>) {
        let (mut replica, recorded) = replica(None);
        replica.subscribe("repoX", "main", 0, Some(7));
        confirm(&mut replica);
        replica.handle(Packet::Synced(Synced { tick: 0 }));
        (replica, recorded)
    }

    fn is_resubscribe(packets: &[Packet], tick: Tick) -> bool {
        matches!(
            packets,
            [Packet::Unsubscribe(_), Packet::Subscribe(Subscribe { tick: t, .. })] if *t == tick
        )
    }

    #[test]
    fn backlog_is_applied_in_order_then_session_goes_live() {
        let (mut replica, recorded) = replica(None);
        let sent = replica.subscribe("repoX", "main", 0, None);
        assert!(matches!(sent.as_slice(), [Packet::Subscribe(_)]));
        assert_eq!(replica.state(), Some(SessionState::Subscribing));
        confirm(&mut replica);

        for tick in 1..=5 {
            assert!(replica.handle(event(tick)).is_empty());
        }
        assert_eq!(replica.state(), Some(SessionState::Replaying));
        replica.handle(Packet::Synced(Synced { tick: 5 }));

        assert_eq!(replica.state(), Some(SessionState::Live));
        assert_eq!(replica.last_tick(), Some(5));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.applied, vec![1, 2, 3, 4, 5]);
        assert_eq!(recorded.ready, 1);
    }

    #[test]
    fn duplicates_are_dropped() {
        let (mut replica, recorded) = live_replica();

        replica.handle(event(1));
        replica.handle(event(1));
        replica.handle(event(2));
        replica.handle(event(1));

        assert_eq!(recorded.lock().unwrap().applied, vec![1, 2]);
    }

    #[test]
    fn live_gap_forces_resubscription_at_last_good_tick() {
        let (mut replica, recorded) = live_replica();
        replica.handle(event(1));

        let sent = replica.handle(event(3));

        assert!(is_resubscribe(&sent, 1));
        assert_eq!(replica.state(), Some(SessionState::Subscribing));

        // In-flight live traffic from before the resubscription is discarded.
        assert!(replica.handle(event(2)).is_empty());
        assert!(replica.handle(event(4)).is_empty());
        assert_eq!(replica.last_tick(), Some(1));
        confirm(&mut replica);
        for tick in 2..=4 {
            replica.handle(event(tick));
        }
        replica.handle(Packet::Synced(Synced { tick: 4 }));

        assert_eq!(recorded.lock().unwrap().applied, vec![1, 2, 3, 4]);
        assert_eq!(recorded.lock().unwrap().ready, 1);
        assert_eq!(replica.state(), Some(SessionState::Live));
    }

    #[test]
    fn replaying_the_same_backlog_twice_is_idempotent() {
        let (mut replica, recorded) = replica(None);
        replica.subscribe("repoX", "main", 0, None);
        confirm(&mut replica);

        for _ in 0..2 {
            for tick in 1..=3 {
                replica.handle(event(tick));
            }
        }
        replica.handle(Packet::Synced(Synced { tick: 3 }));

        assert_eq!(recorded.lock().unwrap().applied, vec![1, 2, 3]);
    }

    #[test]
    fn own_events_are_acknowledged_without_being_applied() {
        let (mut replica, recorded) = live_replica();

        let sent = replica
            .local_event(EventPayload::new("rename"))
            .expect("subscribed replica accepts local events");
        assert!(matches!(sent, Packet::Event(Event { tick: 1, .. })));

        replica.handle(event(1));
        replica.handle(Packet::Committed(Committed { tick: 2 }));
        replica.handle(event(3));

        assert_eq!(replica.last_tick(), Some(3));
        assert_eq!(recorded.lock().unwrap().applied, vec![1, 3]);
    }

    #[test]
    fn failed_apply_keeps_the_watermark_and_recovers_on_resync() {
        let (mut replica, recorded) = replica(Some(2));
        replica.subscribe("repoX", "main", 0, None);
        confirm(&mut replica);
        replica.handle(Packet::Synced(Synced { tick: 0 }));

        replica.handle(event(1));
        replica.handle(event(2));
        assert_eq!(replica.last_tick(), Some(1));

        let sent = replica.handle(event(3));
        assert!(is_resubscribe(&sent, 1));
        confirm(&mut replica);
        replica.handle(event(2));
        replica.handle(event(3));
        replica.handle(Packet::Synced(Synced { tick: 3 }));

        assert_eq!(recorded.lock().unwrap().applied, vec![1, 2, 3]);
    }

    #[test]
    fn flag_is_raised_only_while_applying() {
        let (mut replica, recorded) = replica(None);
        let shared = replica.remote_apply_flag();
        replica.hooks = Box::new(Recorder {
            recorded: recorded.clone(),
            flag: Some(shared.clone()),
            fail_at: None,
        });
        replica.subscribe("repoX", "main", 0, None);
        confirm(&mut replica);

        replica.handle(event(1));

        assert_eq!(recorded.lock().unwrap().flag_seen, vec![true]);
        assert!(!shared.load(Ordering::SeqCst));
    }

    #[test]
    fn local_event_requires_subscription() {
        let (mut replica, _) = replica(None);

        assert!(matches!(
            replica.local_event(EventPayload::new("rename")),
            Err(Error::NotSubscribed)
        ));
    }

    #[test]
    fn refused_subscription_closes_the_session() {
        let (mut replica, recorded) = replica(None);
        replica.subscribe("repoX", "ghost", 0, None);

        replica.handle(Packet::Error(
            None,
            ErrorReply {
                code: ErrorCode::NotFound,
                message: "Unknown branch repoX/ghost".to_string(),
            },
        ));

        assert_eq!(replica.state(), None);
        assert_eq!(recorded.lock().unwrap().closed, 1);
    }

    #[test]
    fn peer_notifications_reach_the_hooks() {
        let (mut replica, recorded) = live_replica();

        replica.handle(Packet::UpdateCursors(UpdateCursors {
            position: 0x401000,
            color: Some(1),
        }));

        assert_eq!(recorded.lock().unwrap().cursors, vec![0x401000]);
    }

    #[test]
    fn switching_branches_drops_traffic_of_the_old_one() {
        let (mut replica, recorded) = replica(None);
        replica.subscribe("repoX", "main", 3, None);
        confirm(&mut replica);
        replica.handle(Packet::Synced(Synced { tick: 3 }));

        let sent = replica.subscribe("repoX", "dev", 3, None);
        assert!(matches!(
            sent.as_slice(),
            [Packet::Unsubscribe(_), Packet::Subscribe(Subscribe { branch, .. })] if branch == "dev"
        ));

        // Still in flight from main when the switch happened.
        replica.handle(event(4));
        replica.handle(Packet::Committed(Committed { tick: 4 }));
        replica.handle(Packet::Synced(Synced { tick: 4 }));
        assert_eq!(replica.last_tick(), Some(3));
        assert_eq!(replica.state(), Some(SessionState::Subscribing));

        confirm(&mut replica);
        replica.handle(event(4));
        replica.handle(Packet::Synced(Synced { tick: 4 }));

        assert_eq!(replica.last_tick(), Some(4));
        assert_eq!(replica.state(), Some(SessionState::Live));
        assert_eq!(recorded.lock().unwrap().applied, vec![4]);
    }

    #[test]
    fn confirmation_of_an_earlier_subscription_is_ignored() {
        let (mut replica, _) = replica(None);
        replica.subscribe("repoX", "main", 0, None);
        let stale = replica.session.as_ref().unwrap().epoch;
        replica.subscribe("repoX", "dev", 0, None);

        replica.handle(Packet::Subscribed(Subscribed { epoch: stale }));
        assert_eq!(replica.state(), Some(SessionState::Subscribing));

        confirm(&mut replica);
        assert_eq!(replica.state(), Some(SessionState::Replaying));
    }

    #[test]
    fn payload_cannot_shadow_envelope_keys() {
        let (mut replica, _) = live_replica();

        let error = replica
            .local_event(EventPayload::new("rename").with("tick", 99u64))
            .unwrap_err();

        assert!(matches!(error, Error::ReservedKey { key: "tick" }));
        assert_eq!(error.code(), ErrorCode::InvalidRequest);
        assert!(replica.local_event(EventPayload::new("rename")).is_ok());
    }

    #[test]
    fn exhausted_tick_counter_closes_the_session() {
        let (mut replica, recorded) = replica(None);
        replica.subscribe("repoX", "main", u64::MAX, None);
        confirm(&mut replica);
        replica.handle(Packet::Synced(Synced { tick: u64::MAX }));

        assert!(matches!(
            replica.local_event(EventPayload::new("rename")),
            Err(Error::Protocol(ProtocolError::TickOverflow(u64::MAX)))
        ));

        replica.handle(event(u64::MAX));

        assert_eq!(replica.state(), None);
        assert_eq!(recorded.lock().unwrap().closed, 1);
        assert!(recorded.lock().unwrap().applied.is_empty());
    }
}
