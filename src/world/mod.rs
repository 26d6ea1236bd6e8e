//! In-memory world state backed by the snapshot store.
//!
//! Every entity kind has its own sharded table keyed by [`Gid`]; there is
//! no lock over the world as a whole. Mutations go through the table and
//! are then persisted with [`World::persist`], which serializes writers
//! per store key and always writes the latest state of the entity.

pub mod entities;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::TtlCache;
use crate::gid::{Gid, GidGenerator};
use crate::store::{Store, StoreError, StoreKey};

pub use entities::{
    Community, Message, MessageView, Persistable, SnapshotError, Thread, User, UserSummary,
};

const DISCRIMINATOR_ATTEMPTS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Gid },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Entity kinds the world keeps a table for.
pub trait Stored: Persistable {
    fn table(world: &World) -> &DashMap<Gid, Self>;
}

impl Stored for User {
    fn table(world: &World) -> &DashMap<Gid, Self> {
        &world.users
    }
}

impl Stored for Community {
    fn table(world: &World) -> &DashMap<Gid, Self> {
        &world.communities
    }
}

impl Stored for Thread {
    fn table(world: &World) -> &DashMap<Gid, Self> {
        &world.threads
    }
}

impl Stored for Message {
    fn table(world: &World) -> &DashMap<Gid, Self> {
        &world.messages
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    pub written: usize,
    pub failed: usize,
}

pub struct World {
    store: Store,
    ids: GidGenerator,
    pub users: DashMap<Gid, User>,
    pub communities: DashMap<Gid, Community>,
    pub threads: DashMap<Gid, Thread>,
    pub messages: DashMap<Gid, Message>,
    /// (lowercased username, discriminator) -> user
    usernames: DashMap<(String, u16), Gid>,
    /// thread -> message ids, oldest first
    thread_messages: DashMap<Gid, BTreeSet<Gid>>,
    history: TtlCache<Gid, Arc<Vec<MessageView>>>,
    persist_locks: DashMap<StoreKey, Arc<AsyncMutex<()>>>,
}

impl World {
    pub fn new(store: Store, history_ttl: Duration, history_capacity: usize) -> Self {
        Self {
            store,
            ids: GidGenerator::new(),
            users: DashMap::new(),
            communities: DashMap::new(),
            threads: DashMap::new(),
            messages: DashMap::new(),
            usernames: DashMap::new(),
            thread_messages: DashMap::new(),
            history: TtlCache::new(history_ttl, history_capacity),
            persist_locks: DashMap::new(),
        }
    }

    /// Builds the world from every snapshot in `store`. Files that fail to
    /// decode or validate are logged and skipped.
    pub async fn load(store: Store, history_ttl: Duration, history_capacity: usize) -> Result<Self, WorldError> {
        let world = Self::new(store, history_ttl, history_capacity);

        for user in load_kind::<User>(&world.store, &[User::KIND]).await? {
            world.usernames.insert((user.username.to_lowercase(), user.discriminator), user.id);
            world.users.insert(user.id, user);
        }
        for community in load_kind::<Community>(&world.store, &[Community::KIND]).await? {
            world.communities.insert(community.id, community);
        }
        for thread in load_kind::<Thread>(&world.store, &[Thread::KIND]).await? {
            world.threads.insert(thread.id, thread);
        }

        let listing = world.store.list(&[Thread::KIND]).await?;
        for ns in &listing.namespaces {
            for message in load_kind::<Message>(&world.store, &[Thread::KIND, ns.as_str(), Message::KIND]).await? {
                if message.thread.to_hex() != *ns || !world.threads.contains_key(&message.thread) {
                    tracing::warn!("[world] [orphan_message] id={} thread={}", message.id, message.thread);
                    continue;
                }
                world.thread_messages.entry(message.thread).or_default().insert(message.id);
                world.messages.insert(message.id, message);
            }
        }

        tracing::info!(
            "[world] [loaded] users={} communities={} threads={} messages={}",
            world.users.len(),
            world.communities.len(),
            world.threads.len(),
            world.messages.len()
        );
        Ok(world)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn next_id(&self) -> Gid {
        self.ids.generate()
    }

    fn persist_lock(&self, key: &StoreKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.persist_locks.entry(key.clone()).or_default().value())
    }

    /// Writes the current state of entity `id` to the store.
    pub async fn persist<T: Stored>(&self, id: Gid) -> Result<(), WorldError> {
        let key = T::table(self)
            .get(&id)
            .map(|e| e.store_key())
            .ok_or(WorldError::NotFound { kind: T::KIND, id })?;

        let lock = self.persist_lock(&key);
        let _guard = lock.lock().await;
        // snapshot under the key lock so the last writer stores the newest state
        let bytes = match T::table(self).get(&id) {
            Some(entity) => entity.to_bytes()?,
            None => return Ok(()),
        };
        self.store.write(&key, &bytes).await?;
        Ok(())
    }

    /// Adds a new entity and persists it. The entity is taken back out of
    /// its table if the write fails.
    pub async fn insert<T: Stored>(&self, entity: T) -> Result<(), WorldError> {
        let id = entity.id();
        T::table(self).insert(id, entity);
        if let Err(e) = self.persist::<T>(id).await {
            T::table(self).remove(&id);
            tracing::warn!("[world] [insert_failed] kind={} id={} error={}", T::KIND, id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Removes the entity and its snapshot. The entity goes back into its
    /// table if the snapshot cannot be deleted.
    pub async fn remove<T: Stored>(&self, id: Gid) -> Result<Option<T>, WorldError> {
        let Some((_, entity)) = T::table(self).remove(&id) else {
            return Ok(None);
        };
        let key = entity.store_key();
        let lock = self.persist_lock(&key);
        let deleted = {
            let _guard = lock.lock().await;
            self.store.delete(&key).await
        };
        if let Err(e) = deleted {
            T::table(self).insert(id, entity);
            return Err(e.into());
        }
        self.persist_locks.remove(&key);
        Ok(Some(entity))
    }

    /// Re-reads entity `id` from disk into the live instance.
    pub async fn reload<T: Stored>(&self, id: Gid) -> Result<(), WorldError> {
        let key = T::table(self)
            .get(&id)
            .map(|e| e.store_key())
            .ok_or(WorldError::NotFound { kind: T::KIND, id })?;
        let bytes = self.store.read(&key).await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(SnapshotError::Decode)?;

        let mut entity = T::table(self).get_mut(&id).ok_or(WorldError::NotFound { kind: T::KIND, id })?;
        entity.restore(&value)?;
        Ok(())
    }

    /// Persists every entity. Failures are logged and counted.
    pub async fn checkpoint(&self) -> CheckpointReport {
        let mut report = CheckpointReport::default();
        self.checkpoint_kind::<User>(&mut report).await;
        self.checkpoint_kind::<Community>(&mut report).await;
        self.checkpoint_kind::<Thread>(&mut report).await;
        self.checkpoint_kind::<Message>(&mut report).await;
        tracing::info!("[world] [checkpoint] written={} failed={}", report.written, report.failed);
        report
    }

    async fn checkpoint_kind<T: Stored>(&self, report: &mut CheckpointReport) {
        let ids: Vec<Gid> = T::table(self).iter().map(|e| *e.key()).collect();
        for id in ids {
            match self.persist::<T>(id).await {
                Ok(()) => report.written += 1,
                Err(WorldError::NotFound { .. }) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("[world] [checkpoint_failed] kind={} id={} error={}", T::KIND, id, e);
                }
            }
        }
    }

    // ============================================
    // Users
    // ============================================

    /// Reserves a free discriminator for `username` on behalf of `user_id`.
    pub fn reserve_username(&self, username: &str, user_id: Gid) -> Option<u16> {
        let name = username.to_lowercase();
        let mut rng = rand::thread_rng();
        for _ in 0..DISCRIMINATOR_ATTEMPTS {
            let d = rng.gen_range(1..=entities::MAX_DISCRIMINATOR);
            if self.try_reserve(&name, d, user_id) {
                return Some(d);
            }
        }
        (1..=entities::MAX_DISCRIMINATOR).find(|&d| self.try_reserve(&name, d, user_id))
    }

    fn try_reserve(&self, name: &str, discriminator: u16, user_id: Gid) -> bool {
        match self.usernames.entry((name.to_string(), discriminator)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(user_id);
                true
            }
        }
    }

    pub fn release_username(&self, username: &str, discriminator: u16) {
        self.usernames.remove(&(username.to_lowercase(), discriminator));
    }

    pub fn find_user(&self, username: &str, discriminator: u16) -> Option<Gid> {
        self.usernames.get(&(username.to_lowercase(), discriminator)).map(|id| *id)
    }

    pub fn summary(&self, user_id: Gid) -> Option<UserSummary> {
        self.users.get(&user_id).map(|u| u.summary())
    }

    // ============================================
    // Threads & messages
    // ============================================

    /// Users who see traffic in `thread_id`: community members for a
    /// community thread, participants otherwise.
    pub fn thread_audience(&self, thread_id: Gid) -> Vec<Gid> {
        let (community, participants) = match self.threads.get(&thread_id) {
            Some(t) => (t.community, t.participants.clone()),
            None => return Vec::new(),
        };
        match community {
            Some(cid) => self
                .communities
                .get(&cid)
                .map(|c| c.members.iter().copied().collect())
                .unwrap_or_default(),
            None => participants.into_iter().collect(),
        }
    }

    pub fn can_access_thread(&self, user: Gid, thread_id: Gid) -> bool {
        self.thread_audience(thread_id).contains(&user)
    }

    /// Inserts a new message, touches its thread and persists both. If the
    /// message cannot be written the thread and its index are left as they
    /// were.
    pub async fn add_message(&self, message: Message) -> Result<(), WorldError> {
        let (thread_id, id, at) = (message.thread, message.id, message.created_at);
        let previous = match self.threads.get_mut(&thread_id) {
            Some(mut t) => t.last_message_at.replace(at),
            None => return Err(WorldError::NotFound { kind: Thread::KIND, id: thread_id }),
        };

        // table before index, index before invalidation, so a page built
        // after the bump sees the whole message
        if let Err(e) = self.insert(message).await {
            if let Some(mut t) = self.threads.get_mut(&thread_id) {
                if t.last_message_at == Some(at) {
                    t.last_message_at = previous;
                }
            }
            return Err(e);
        }
        self.thread_messages.entry(thread_id).or_default().insert(id);
        self.history.invalidate(&thread_id);
        self.persist::<Thread>(thread_id).await
    }

    pub fn invalidate_history(&self, thread_id: Gid) {
        self.history.invalidate(&thread_id);
    }

    pub async fn delete_message(&self, message_id: Gid) -> Result<Option<Message>, WorldError> {
        let removed = self.remove::<Message>(message_id).await?;
        if let Some(m) = &removed {
            if let Some(mut ids) = self.thread_messages.get_mut(&m.thread) {
                ids.remove(&m.id);
            }
            self.history.invalidate(&m.thread);
        }
        Ok(removed)
    }

    /// Newest-first page of a thread, strictly older than `before` when given.
    pub fn history(&self, thread_id: Gid, before: Option<Gid>, limit: usize) -> Vec<MessageView> {
        let all = match self.history.get(&thread_id) {
            Some(cached) => cached,
            None => {
                let generation = self.history.generation(&thread_id);
                let ids: Vec<Gid> = self
                    .thread_messages
                    .get(&thread_id)
                    .map(|ids| ids.iter().rev().copied().collect())
                    .unwrap_or_default();
                let views: Vec<MessageView> =
                    ids.into_iter().filter_map(|id| self.messages.get(&id).map(|m| m.view())).collect();
                let views = Arc::new(views);
                self.history.insert_if_current(thread_id, Arc::clone(&views), generation);
                views
            }
        };
        all.iter()
            .filter(|m| before.map_or(true, |b| m.id < b))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn purge_history_cache(&self) -> usize {
        self.history.purge_expired()
    }
}

async fn load_kind<T: Persistable>(store: &Store, namespace: &[&str]) -> Result<Vec<T>, WorldError> {
    let listing = store.list(namespace).await?;
    let mut out = Vec::with_capacity(listing.entries.len());
    for name in listing.entries {
        let Ok(expected) = Gid::from_hex(&name) else {
            tracing::warn!("[world] [skip] kind={} file={} reason=bad_name", T::KIND, name);
            continue;
        };
        let mut segments: Vec<&str> = namespace.to_vec();
        segments.push(&name);
        let key = StoreKey::new(segments.iter().copied())?;
        let entity = match store.read(&key).await.map_err(WorldError::from).and_then(|b| Ok(T::from_bytes(&b)?)) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!("[world] [skip] kind={} key={} error={}", T::KIND, key, e);
                continue;
            }
        };
        if entity.id() != expected {
            tracing::warn!("[world] [skip] kind={} key={} reason=id_mismatch", T::KIND, key);
            continue;
        }
        out.push(entity);
    }
    Ok(out)
}
