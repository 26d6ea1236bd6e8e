//! Persistable domain entities.
//!
//! Entities refer to each other by [`Gid`] only; the [`World`](super::World)
//! owns every instance. A snapshot is the entity's JSON form, and restoring
//! from one goes through a fully validated candidate before any field of
//! the live entity is replaced.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gid::Gid;
use crate::store::StoreKey;

pub const MIN_USERNAME_LEN: usize = 2;
pub const MAX_USERNAME_LEN: usize = 32;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_STATUS_LEN: usize = 128;
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_MESSAGE_LEN: usize = 4000;
pub const MAX_DISCRIMINATOR: u16 = 9999;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Snapshot decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Snapshot identity mismatch: expected={expected}, found={found}")]
    IdentityMismatch { expected: Gid, found: Gid },

    #[error("Invalid snapshot: {0}")]
    Invalid(String),
}

pub trait Persistable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Top-level store namespace of this kind.
    const KIND: &'static str;

    fn id(&self) -> Gid;

    /// Structural checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), SnapshotError>;

    fn store_key(&self) -> StoreKey {
        StoreKey::entity(Self::KIND, self.id())
    }

    fn snapshot(&self) -> Result<Value, SnapshotError> {
        serde_json::to_value(self).map_err(SnapshotError::Encode)
    }

    /// Replaces this entity's state with `value`. On any error the entity
    /// is left untouched.
    fn restore(&mut self, value: &Value) -> Result<(), SnapshotError> {
        let candidate = Self::deserialize(value).map_err(SnapshotError::Decode)?;
        if candidate.id() != self.id() {
            return Err(SnapshotError::IdentityMismatch { expected: self.id(), found: candidate.id() });
        }
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    fn from_snapshot(value: &Value) -> Result<Self, SnapshotError> {
        let entity = Self::deserialize(value).map_err(SnapshotError::Decode)?;
        entity.validate()?;
        Ok(entity)
    }

    /// Compact JSON, as written to the store.
    fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(SnapshotError::Encode)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let value: Value = serde_json::from_slice(bytes).map_err(SnapshotError::Decode)?;
        Self::from_snapshot(&value)
    }
}

fn invalid(msg: impl Into<String>) -> SnapshotError {
    SnapshotError::Invalid(msg.into())
}

pub fn is_valid_username(s: &str) -> bool {
    let len = s.chars().count();
    (MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len)
        && s.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub fn is_valid_password(s: &str) -> bool {
    // bcrypt only looks at the first 72 bytes
    (8..=72).contains(&s.len())
}

// ============================================
// User
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Gid,
    pub username: String,
    pub discriminator: u16,
    pub display_name: String,
    pub password_hash: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub friends: BTreeSet<Gid>,
    #[serde(default)]
    pub incoming: BTreeSet<Gid>,
    #[serde(default)]
    pub outgoing: BTreeSet<Gid>,
    #[serde(default)]
    pub disabled: bool,
    pub created_at: u64,
}

impl User {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            discriminator: self.discriminator,
            display_name: self.display_name.clone(),
            status: self.status.clone(),
        }
    }

    /// `name#0042`
    pub fn handle(&self) -> String {
        format!("{}#{:04}", self.username, self.discriminator)
    }
}

impl Persistable for User {
    const KIND: &'static str = "users";

    fn id(&self) -> Gid {
        self.id
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        if !is_valid_username(&self.username) {
            return Err(invalid(format!("bad username {:?}", self.username)));
        }
        if !(1..=MAX_DISCRIMINATOR).contains(&self.discriminator) {
            return Err(invalid(format!("discriminator out of range: {}", self.discriminator)));
        }
        if self.display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(invalid("display_name too long"));
        }
        if self.password_hash.is_empty() {
            return Err(invalid("missing password hash"));
        }
        if self.friends.contains(&self.id) || self.incoming.contains(&self.id) || self.outgoing.contains(&self.id) {
            return Err(invalid("user relates to itself"));
        }
        Ok(())
    }
}

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Gid,
    pub username: String,
    pub discriminator: u16,
    pub display_name: String,
    pub status: String,
}

// ============================================
// Community
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: Gid,
    pub name: String,
    pub owner: Gid,
    #[serde(default)]
    pub members: BTreeSet<Gid>,
    #[serde(default)]
    pub threads: BTreeSet<Gid>,
    pub created_at: u64,
}

impl Persistable for Community {
    const KIND: &'static str = "communities";

    fn id(&self) -> Gid {
        self.id
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        if self.name.trim().is_empty() || self.name.chars().count() > MAX_TITLE_LEN {
            return Err(invalid("bad community name"));
        }
        if !self.members.contains(&self.owner) {
            return Err(invalid("owner is not a member"));
        }
        Ok(())
    }
}

// ============================================
// Thread
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: Gid,
    /// `None` for a direct thread between `participants`.
    #[serde(default)]
    pub community: Option<Gid>,
    pub title: String,
    #[serde(default)]
    pub participants: BTreeSet<Gid>,
    pub created_at: u64,
    #[serde(default)]
    pub last_message_at: Option<u64>,
}

impl Persistable for Thread {
    const KIND: &'static str = "threads";

    fn id(&self) -> Gid {
        self.id
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(invalid("title too long"));
        }
        if self.community.is_none() && self.participants.len() < 2 {
            return Err(invalid("direct thread needs two participants"));
        }
        Ok(())
    }
}

// ============================================
// Message
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Gid,
    pub thread: Gid,
    pub author: Gid,
    pub body: String,
    pub created_at: u64,
    #[serde(default)]
    pub edited_at: Option<u64>,
}

impl Message {
    pub fn view(&self) -> MessageView {
        MessageView {
            id: self.id,
            thread_id: self.thread,
            author: self.author,
            body: self.body.clone(),
            created_at: self.created_at,
            edited_at: self.edited_at,
        }
    }
}

impl Persistable for Message {
    const KIND: &'static str = "messages";

    fn id(&self) -> Gid {
        self.id
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        if self.body.is_empty() || self.body.chars().count() > MAX_MESSAGE_LEN {
            return Err(invalid("bad message body"));
        }
        Ok(())
    }

    /// Messages live beneath their thread.
    fn store_key(&self) -> StoreKey {
        StoreKey::entity(Thread::KIND, self.thread)
            .child(Self::KIND)
            .and_then(|k| k.child(&self.id.to_hex()))
            .unwrap_or_else(|_| StoreKey::entity(Self::KIND, self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Gid,
    pub thread_id: Gid,
    pub author: Gid,
    pub body: String,
    pub created_at: u64,
    pub edited_at: Option<u64>,
}
