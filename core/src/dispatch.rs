use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::events::{InboundEvent, OutboundEvent};
use crate::messages::{MessageService, NewMessage};
use crate::model::{MessageView, ReactionEvent};
use crate::reactions::ReactionService;
use crate::rooms::{ConnId, RoomBroadcaster};

/// Per-chat locks ordering "store, then fan out" for each chat.
#[derive(Default)]
pub struct ChatSequencer {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatSequencer {
    pub fn lock_for(&self, chat_id: i64) -> Arc<Mutex<()>> {
        self.locks.lock().entry(chat_id).or_default().clone()
    }
}

/// Routes inbound real-time events to the services and fans results out.
#[derive(Clone)]
pub struct Dispatcher {
    messages: MessageService,
    reactions: ReactionService,
    rooms: RoomBroadcaster,
    sequencer: Arc<ChatSequencer>,
}

impl Dispatcher {
    pub fn new(
        messages: MessageService,
        reactions: ReactionService,
        rooms: RoomBroadcaster,
    ) -> Self {
        Self {
            messages,
            reactions,
            rooms,
            sequencer: Arc::default(),
        }
    }

    pub fn rooms(&self) -> &RoomBroadcaster {
        &self.rooms
    }

    pub async fn handle(&self, conn: ConnId, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Join { username, room } => self.rooms.join(conn, room, &username),
            InboundEvent::Leave { username, room } => self.rooms.leave(conn, room, &username),
            InboundEvent::SendMessage {
                chat_id,
                user_id,
                content,
                kind,
                file_path,
                reply_to_id,
            } => {
                self.send_message(NewMessage {
                    chat_id,
                    author_id: user_id,
                    content,
                    kind,
                    file_ref: file_path,
                    reply_to_id,
                })
                .await?;
            }
            InboundEvent::Typing { username, chat_id } => {
                let sent = self.rooms.broadcast(
                    chat_id,
                    &OutboundEvent::UserTyping { username, chat_id },
                    Some(conn),
                );
                debug!(chat_id, sent, "typing relayed");
            }
            InboundEvent::AddReaction {
                message_id,
                user_id,
                emoji,
                chat_id,
            } => {
                self.mutate_reaction(chat_id, || {
                    self.reactions.set_reaction(message_id, user_id, &emoji, chat_id)
                })?;
            }
            InboundEvent::RemoveReaction {
                message_id,
                user_id,
                chat_id,
            } => {
                self.mutate_reaction(chat_id, || {
                    self.reactions.clear_reaction(message_id, user_id, chat_id)
                })?;
            }
        }
        Ok(())
    }

    /// Create a message and deliver it to its room, then nudge every client
    /// to refresh its chat list.
    ///
    /// The preview is resolved before the chat's sequencer is taken, so a
    /// slow page never holds up other senders in the same chat.
    pub async fn send_message(&self, draft: NewMessage) -> Result<MessageView> {
        let draft = self.messages.validate(draft)?;
        let preview = self.messages.resolve_preview(&draft).await;
        let chat_id = draft.chat_id();
        let message = {
            let lock = self.sequencer.lock_for(chat_id);
            let _order = lock.lock();
            let message = self.messages.persist(draft, preview)?;
            self.rooms
                .broadcast(chat_id, &OutboundEvent::NewMessage(message.clone()), None);
            message
        };
        self.rooms
            .broadcast_global(&OutboundEvent::ChatUpdated { chat_id });
        Ok(message)
    }

    fn mutate_reaction<F>(&self, chat_id: i64, apply: F) -> Result<()>
    where
        F: FnOnce() -> Result<ReactionEvent>,
    {
        let lock = self.sequencer.lock_for(chat_id);
        let _order = lock.lock();
        let event = apply()?;
        self.rooms.broadcast(chat_id, &event.into(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageKind;
    use crate::testutil;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn dispatcher(store: &crate::Store) -> Dispatcher {
        Dispatcher::new(
            MessageService::new(store.clone(), None),
            ReactionService::new(store.clone()),
            RoomBroadcaster::new(),
        )
    }

    #[tokio::test]
    async fn message_reaches_room_then_chat_updated_goes_global() {
        let (store, users) = testutil::store_with_users(&["alice", "bob"]);
        let chat = testutil::direct_chat(&store, users[0].id, users[1].id);
        let d = dispatcher(&store);
        let (a, mut rx_a) = d.rooms().connect();
        let (b, mut rx_b) = d.rooms().connect();
        let (_idle, mut rx_idle) = d.rooms().connect();
        d.handle(a, InboundEvent::Join { username: "alice".into(), room: chat })
            .await
            .unwrap();
        d.handle(b, InboundEvent::Join { username: "bob".into(), room: chat })
            .await
            .unwrap();
        drain(&mut rx_a);

        d.handle(
            a,
            InboundEvent::SendMessage {
                chat_id: chat,
                user_id: users[0].id,
                content: Some("hello".into()),
                kind: MessageKind::Text,
                file_path: None,
                reply_to_id: None,
            },
        )
        .await
        .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert_eq!(events.len(), 2);
            match &events[0] {
                OutboundEvent::NewMessage(m) => {
                    assert_eq!(m.content.as_deref(), Some("hello"));
                    assert_eq!(m.username, "alice");
                    assert!(m.link_preview.is_none());
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(events[1], OutboundEvent::ChatUpdated { chat_id: chat });
        }
        assert_eq!(drain(&mut rx_idle), vec![OutboundEvent::ChatUpdated { chat_id: chat }]);
    }

    #[tokio::test]
    async fn typing_skips_sender() {
        let (store, _) = testutil::store_with_users(&["alice"]);
        let d = dispatcher(&store);
        let (a, mut rx_a) = d.rooms().connect();
        let (b, mut rx_b) = d.rooms().connect();
        for (conn, name) in [(a, "alice"), (b, "bob")] {
            d.handle(conn, InboundEvent::Join { username: name.into(), room: 5 })
                .await
                .unwrap();
        }
        drain(&mut rx_a);
        d.handle(a, InboundEvent::Typing { username: "alice".into(), chat_id: 5 })
            .await
            .unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![OutboundEvent::UserTyping { username: "alice".into(), chat_id: 5 }]
        );
    }

    #[tokio::test]
    async fn reactions_are_broadcast_in_applied_order() {
        let (store, users) = testutil::store_with_users(&["alice", "bob"]);
        let chat = testutil::direct_chat(&store, users[0].id, users[1].id);
        let m = testutil::insert_message(&store, chat, users[1].id, "hi");
        let d = dispatcher(&store);
        let (b, mut rx_b) = d.rooms().connect();
        d.handle(b, InboundEvent::Join { username: "bob".into(), room: chat })
            .await
            .unwrap();

        for emoji in ["👍", "😂"] {
            d.handle(
                b,
                InboundEvent::AddReaction {
                    message_id: m,
                    user_id: users[0].id,
                    emoji: emoji.into(),
                    chat_id: chat,
                },
            )
            .await
            .unwrap();
        }
        d.handle(
            b,
            InboundEvent::RemoveReaction { message_id: m, user_id: users[0].id, chat_id: chat },
        )
        .await
        .unwrap();

        let names: Vec<_> = drain(&mut rx_b).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["reaction_added", "reaction_added", "reaction_removed"]);
    }

    #[tokio::test]
    async fn failed_send_broadcasts_nothing() {
        let (store, users) = testutil::store_with_users(&["alice"]);
        let d = dispatcher(&store);
        let (a, mut rx_a) = d.rooms().connect();
        d.handle(a, InboundEvent::Join { username: "alice".into(), room: 1 })
            .await
            .unwrap();
        let err = d
            .handle(
                a,
                InboundEvent::SendMessage {
                    chat_id: 1,
                    user_id: users[0].id,
                    content: Some("nobody home".into()),
                    kind: MessageKind::Text,
                    file_path: None,
                    reply_to_id: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_arrive_in_persisted_order() {
        let (store, users) = testutil::store_with_users(&["alice", "bob"]);
        let chat = testutil::direct_chat(&store, users[0].id, users[1].id);
        let d = dispatcher(&store);
        let (b, mut rx_b) = d.rooms().connect();
        d.rooms().join(b, chat, "bob");

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let d = d.clone();
                let author = users[i % 2].id;
                tokio::spawn(async move {
                    d.send_message(NewMessage {
                        chat_id: chat,
                        author_id: author,
                        content: Some(format!("m{i}")),
                        ..Default::default()
                    })
                    .await
                    .unwrap()
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        let delivered: Vec<i64> = drain(&mut rx_b)
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::NewMessage(m) => Some(m.id),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.len(), 20);
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
    }
}
