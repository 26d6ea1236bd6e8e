//! Event fan-out to every live session of a user.
//!
//! The hub keeps `user -> sessions` plus the reverse `session -> user`
//! index. Publishing encodes the frame once and pushes it onto each
//! session's own bounded queue without waiting, so a stalled session only
//! ever loses its own events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::gid::{now_ms, Gid, GidGenerator};
use crate::network::{Frame, FrameKind};
use crate::session::{Session, SessionError};
use crate::world::{MessageView, UserSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    MessageCreated { message: MessageView },
    MessageEdited { message: MessageView },
    MessageDeleted { thread_id: Gid, message_id: Gid },
    FriendRequested { from: UserSummary },
    FriendAdded { user: UserSummary },
    FriendRemoved { user_id: Gid },
    ProfileUpdated { user: UserSummary },
    MemberJoined { community_id: Gid, user: UserSummary },
    MemberLeft { community_id: Gid, user_id: Gid },
    Notification { text: String },
}

impl Event {
    /// Wire tag of the event frame.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::MessageCreated { .. } => "message.created",
            Event::MessageEdited { .. } => "message.edited",
            Event::MessageDeleted { .. } => "message.deleted",
            Event::FriendRequested { .. } => "friend.requested",
            Event::FriendAdded { .. } => "friend.added",
            Event::FriendRemoved { .. } => "friend.removed",
            Event::ProfileUpdated { .. } => "profile.updated",
            Event::MemberJoined { .. } => "community.member_joined",
            Event::MemberLeft { .. } => "community.member_left",
            Event::Notification { .. } => "notification",
        }
    }
}

/// Fields shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Gid,
    pub at: u64,
    pub event: Event,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct EventHub {
    by_user: DashMap<Gid, HashMap<u64, Arc<Session>>>,
    by_session: DashMap<u64, (Gid, Arc<Session>)>,
    ids: GidGenerator,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            by_user: DashMap::new(),
            by_session: DashMap::new(),
            ids: GidGenerator::new(),
        }
    }

    /// Registers `session` under `user`. Re-registering under another user
    /// moves it.
    pub fn register(&self, user: Gid, session: &Arc<Session>) {
        if let Some(previous) = self.by_session.insert(session.id, (user, Arc::clone(session))) {
            if previous.0 != user {
                self.detach_from_user(previous.0, session.id);
            }
        }
        self.by_user
            .entry(user)
            .or_default()
            .insert(session.id, Arc::clone(session));
        session.set_accepting_events(true);
        tracing::debug!("[events] [register] user={} session={}", user, session.id);
    }

    /// Removes the session from the hub. Once this returns, no publish can
    /// enqueue onto it. Returns the user it was registered under.
    pub fn unregister(&self, session_id: u64) -> Option<Gid> {
        let (_, (user, session)) = self.by_session.remove(&session_id)?;
        session.set_accepting_events(false);
        self.detach_from_user(user, session_id);
        tracing::debug!("[events] [unregister] user={} session={}", user, session_id);
        Some(user)
    }

    fn detach_from_user(&self, user: Gid, session_id: u64) {
        if let Some(mut sessions) = self.by_user.get_mut(&user) {
            sessions.remove(&session_id);
        }
        self.by_user.remove_if(&user, |_, sessions| sessions.is_empty());
    }

    pub fn sessions_of(&self, user: Gid) -> usize {
        self.by_user.get(&user).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_online(&self, user: Gid) -> bool {
        self.sessions_of(user) > 0
    }

    pub fn envelope(&self, event: Event) -> EventEnvelope {
        EventEnvelope { id: self.ids.generate(), at: now_ms(), event }
    }

    fn encode(&self, event: Event) -> Option<(&'static str, bytes::Bytes)> {
        let envelope = self.envelope(event);
        let tag = envelope.event.tag();
        match Frame::new(FrameKind::Event, tag, &envelope).and_then(|f| f.encode()) {
            Ok(bytes) => Some((tag, bytes)),
            Err(e) => {
                tracing::error!("[events] [encode_failed] tag={} error={}", tag, e);
                None
            }
        }
    }

    /// Pushes `event` to one session only, whether or not it is registered
    /// under a user yet.
    pub fn notify_session(&self, session: &Session, event: Event) -> Result<(), SessionError> {
        let Some((tag, bytes)) = self.encode(event) else {
            return Ok(());
        };
        session.push_event(bytes).map_err(|e| {
            tracing::debug!("[events] [skipped] tag={} error={}", tag, e);
            e
        })
    }

    /// Pushes `event` to every session of every target user.
    pub fn publish<I>(&self, targets: I, event: Event) -> PublishReport
    where
        I: IntoIterator<Item = Gid>,
    {
        let Some((tag, encoded)) = self.encode(event) else {
            return PublishReport::default();
        };

        let mut report = PublishReport::default();
        let unique: HashSet<Gid> = targets.into_iter().collect();
        for user in unique {
            // clone the session list so no shard lock is held while pushing
            let sessions: Vec<Arc<Session>> = match self.by_user.get(&user) {
                Some(s) => s.values().cloned().collect(),
                None => continue,
            };
            for session in sessions {
                match session.push_event(encoded.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(SessionError::QueueFull(id)) => {
                        report.dropped += 1;
                        tracing::warn!("[events] [dropped] tag={} session={} reason=queue_full", tag, id);
                    }
                    Err(e) => tracing::debug!("[events] [skipped] tag={} error={}", tag, e),
                }
            }
        }
        tracing::trace!("[events] [publish] tag={} delivered={} dropped={}", tag, report.delivered, report.dropped);
        report
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
