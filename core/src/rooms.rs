use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::OutboundEvent;

/// Handle of one live connection.
pub type ConnId = Uuid;

struct Seat {
    chat_id: i64,
    username: String,
}

struct Session {
    tx: UnboundedSender<OutboundEvent>,
    seat: Option<Seat>,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<i64, HashSet<ConnId>>,
    sessions: HashMap<ConnId, Session>,
}

impl Registry {
    fn members(&self, chat_id: i64, exclude: Option<ConnId>) -> Vec<ConnId> {
        self.rooms
            .get(&chat_id)
            .map(|set| set.iter().copied().filter(|c| Some(*c) != exclude).collect())
            .unwrap_or_default()
    }

    /// Remove a connection from a room's set. Returns false if it was not there.
    fn vacate(&mut self, conn: ConnId, chat_id: i64) -> bool {
        let Some(set) = self.rooms.get_mut(&chat_id) else {
            return false;
        };
        let removed = set.remove(&conn);
        if set.is_empty() {
            self.rooms.remove(&chat_id);
        }
        removed
    }

    fn deliver(&mut self, targets: Vec<ConnId>, event: &OutboundEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in targets {
            match self.sessions.get(&id) {
                Some(session) if session.tx.send(event.clone()).is_ok() => delivered += 1,
                Some(_) => dead.push(id),
                None => {}
            }
        }
        for id in dead {
            warn!(conn = %id, event = event.name(), "send failed, dropping connection");
            self.evict(id);
        }
        delivered
    }

    /// Forget a connection and tell its room it left.
    fn evict(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };
        if let Some(seat) = session.seat {
            if self.vacate(conn, seat.chat_id) {
                let targets = self.members(seat.chat_id, None);
                self.deliver(
                    targets,
                    &OutboundEvent::UserLeft {
                        username: seat.username,
                    },
                );
            }
        }
    }
}

/// In-process registry of rooms and the connections in them.
///
/// All state sits behind one mutex; channel sends never block, so nothing
/// awaits while the lock is held.
#[derive(Clone, Default)]
pub struct RoomBroadcaster {
    inner: Arc<Mutex<Registry>>,
}

impl RoomBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return the stream of events for it.
    pub fn connect(&self) -> (ConnId, UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = unbounded_channel();
        let id = Uuid::new_v4();
        self.inner.lock().sessions.insert(id, Session { tx, seat: None });
        debug!(conn = %id, "connection registered");
        (id, rx)
    }

    /// Put the connection into a chat's room, leaving any previous room.
    pub fn join(&self, conn: ConnId, chat_id: i64, username: &str) {
        let mut reg = self.inner.lock();
        let Some(session) = reg.sessions.get_mut(&conn) else {
            warn!(conn = %conn, "join from unknown connection");
            return;
        };
        let previous = session.seat.replace(Seat {
            chat_id,
            username: username.to_owned(),
        });
        if let Some(prev) = previous.filter(|p| p.chat_id != chat_id) {
            if reg.vacate(conn, prev.chat_id) {
                let targets = reg.members(prev.chat_id, None);
                reg.deliver(
                    targets,
                    &OutboundEvent::UserLeft {
                        username: prev.username,
                    },
                );
            }
        }
        if reg.rooms.entry(chat_id).or_default().insert(conn) {
            let targets = reg.members(chat_id, Some(conn));
            reg.deliver(
                targets,
                &OutboundEvent::UserJoined {
                    username: username.to_owned(),
                },
            );
        }
        debug!(conn = %conn, chat_id, username, "joined room");
    }

    pub fn leave(&self, conn: ConnId, chat_id: i64, username: &str) {
        let mut reg = self.inner.lock();
        if !reg.vacate(conn, chat_id) {
            return;
        }
        if let Some(session) = reg.sessions.get_mut(&conn) {
            if session.seat.as_ref().map(|s| s.chat_id) == Some(chat_id) {
                session.seat = None;
            }
        }
        let targets = reg.members(chat_id, None);
        reg.deliver(
            targets,
            &OutboundEvent::UserLeft {
                username: username.to_owned(),
            },
        );
        debug!(conn = %conn, chat_id, username, "left room");
    }

    /// Send to every connection in the room except `exclude`.
    pub fn broadcast(&self, chat_id: i64, event: &OutboundEvent, exclude: Option<ConnId>) -> usize {
        let mut reg = self.inner.lock();
        let targets = reg.members(chat_id, exclude);
        reg.deliver(targets, event)
    }

    /// Send to every registered connection regardless of room.
    pub fn broadcast_global(&self, event: &OutboundEvent) -> usize {
        let mut reg = self.inner.lock();
        let targets = reg.sessions.keys().copied().collect();
        reg.deliver(targets, event)
    }

    /// Drop a closed connection, leaving whatever room it was in.
    pub fn disconnect(&self, conn: ConnId) {
        self.inner.lock().evict(conn);
        debug!(conn = %conn, "connection closed");
    }

    pub fn room_size(&self, chat_id: i64) -> usize {
        self.inner.lock().rooms.get(&chat_id).map_or(0, HashSet::len)
    }

    #[cfg(test)]
    pub fn room_of(&self, conn: ConnId) -> Option<i64> {
        self.inner
            .lock()
            .sessions
            .get(&conn)
            .and_then(|s| s.seat.as_ref().map(|seat| seat.chat_id))
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn typing(username: &str, chat_id: i64) -> OutboundEvent {
        OutboundEvent::UserTyping {
            username: username.into(),
            chat_id,
        }
    }

    #[test]
    fn join_notifies_others_but_not_joiner() {
        let rooms = RoomBroadcaster::new();
        let (a, mut rx_a) = rooms.connect();
        let (b, mut rx_b) = rooms.connect();
        rooms.join(a, 5, "alice");
        rooms.join(b, 5, "bob");
        assert_eq!(
            drain(&mut rx_a),
            vec![OutboundEvent::UserJoined {
                username: "bob".into()
            }]
        );
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(rooms.room_size(5), 2);
    }

    #[test]
    fn typing_is_not_echoed_to_sender() {
        let rooms = RoomBroadcaster::new();
        let (a, mut rx_a) = rooms.connect();
        let (b, mut rx_b) = rooms.connect();
        rooms.join(a, 5, "alice");
        rooms.join(b, 5, "bob");
        drain(&mut rx_a);

        assert_eq!(rooms.broadcast(5, &typing("alice", 5), Some(a)), 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![typing("alice", 5)]);
    }

    #[test]
    fn rooms_are_isolated_and_global_reaches_everyone() {
        let rooms = RoomBroadcaster::new();
        let (a, mut rx_a) = rooms.connect();
        let (_idle, mut rx_idle) = rooms.connect();
        let (c, mut rx_c) = rooms.connect();
        rooms.join(a, 1, "alice");
        rooms.join(c, 2, "carol");
        rooms.broadcast(1, &typing("x", 1), None);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_c).is_empty());

        let updated = OutboundEvent::ChatUpdated { chat_id: 1 };
        assert_eq!(rooms.broadcast_global(&updated), 3);
        assert_eq!(drain(&mut rx_idle), vec![updated]);
    }

    #[test]
    fn leave_and_switch_rooms() {
        let rooms = RoomBroadcaster::new();
        let (a, mut rx_a) = rooms.connect();
        let (b, _rx_b) = rooms.connect();
        rooms.join(a, 1, "alice");
        rooms.join(b, 1, "bob");
        drain(&mut rx_a);

        rooms.join(b, 2, "bob");
        assert_eq!(
            drain(&mut rx_a),
            vec![OutboundEvent::UserLeft {
                username: "bob".into()
            }]
        );
        assert_eq!(rooms.room_of(b), Some(2));
        assert_eq!(rooms.room_size(1), 1);

        rooms.leave(a, 1, "alice");
        assert_eq!(rooms.room_size(1), 0);
        assert_eq!(rooms.room_of(a), None);
        rooms.leave(a, 1, "alice");
    }

    #[test]
    fn disconnect_cleans_up_via_reverse_index() {
        let rooms = RoomBroadcaster::new();
        let (a, mut rx_a) = rooms.connect();
        let (b, _rx_b) = rooms.connect();
        rooms.join(a, 7, "alice");
        rooms.join(b, 7, "bob");
        drain(&mut rx_a);

        rooms.disconnect(b);
        assert_eq!(rooms.room_size(7), 1);
        assert_eq!(rooms.connection_count(), 1);
        assert_eq!(
            drain(&mut rx_a),
            vec![OutboundEvent::UserLeft {
                username: "bob".into()
            }]
        );
    }

    #[test]
    fn closed_channels_are_pruned_without_aborting_fanout() {
        let rooms = RoomBroadcaster::new();
        let (a, mut rx_a) = rooms.connect();
        let (b, rx_b) = rooms.connect();
        let (c, mut rx_c) = rooms.connect();
        for (conn, name) in [(a, "alice"), (b, "bob"), (c, "carol")] {
            rooms.join(conn, 3, name);
        }
        drain(&mut rx_a);
        drain(&mut rx_c);
        drop(rx_b);

        assert_eq!(rooms.broadcast(3, &typing("dave", 3), None), 2);
        assert_eq!(rooms.room_size(3), 2);
        let left = OutboundEvent::UserLeft {
            username: "bob".into(),
        };
        assert_eq!(drain(&mut rx_a).len(), 2);
        assert!(drain(&mut rx_c).contains(&left));
    }

    #[test]
    fn concurrent_joins_and_leaves_keep_index_consistent() {
        let rooms = RoomBroadcaster::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rooms = rooms.clone();
                std::thread::spawn(move || {
                    let (conn, _rx) = rooms.connect();
                    for round in 0..50 {
                        rooms.join(conn, (i + round) % 4, "user");
                        rooms.broadcast((i + round) % 4, &typing("user", 0), Some(conn));
                    }
                    rooms.disconnect(conn);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rooms.connection_count(), 0);
        for chat in 0..4 {
            assert_eq!(rooms.room_size(chat), 0);
        }
    }
}
